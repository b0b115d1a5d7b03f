//! Compile-argument rewriting.
//!
//! Bazel compile actions run inside the sandbox with worker wrappers,
//! placeholder paths, and execroot-relative inputs. The indexer runs none
//! of that, so the raw action argv is rewritten into a self-contained
//! invocation: wrapper tokens dropped, placeholders substituted, relative
//! paths absolutized, and the index store rewired to the shared global one.
//!
//! The rewriter is a pure function of its inputs.

/// The source language of the document a request is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Swift,
    ObjectiveC,
}

impl Language {
    /// Infer the language from a source path, `None` for headers (which
    /// have no compile action of their own).
    pub fn of_source_path(path: &str) -> Option<Self> {
        if path.ends_with(".swift") {
            Some(Language::Swift)
        } else if path.ends_with(".m") || path.ends_with(".mm") {
            Some(Language::ObjectiveC)
        } else {
            None
        }
    }
}

/// Everything the rewriter needs besides the raw argv.
#[derive(Debug, Clone)]
pub struct RewriteRequest<'a> {
    pub language: Language,
    /// The path being queried: a file path for Objective-C, the module's
    /// representative path for Swift.
    pub content_path: &'a str,
    /// Workspace root as an absolute path.
    pub root: &'a str,
    pub output_base: &'a str,
    pub output_path: &'a str,
    pub developer_dir: &'a str,
    pub sdk_root: &'a str,
    /// The shared index store all rewritten invocations write to.
    pub global_index_store: &'a str,
}

const PLACEHOLDER_EXECUTION_ROOT: &str = "__BAZEL_EXECUTION_ROOT__";
const PLACEHOLDER_SDKROOT: &str = "__BAZEL_XCODE_SDKROOT__";
const PLACEHOLDER_DEVELOPER_DIR: &str = "__BAZEL_XCODE_DEVELOPER_DIR__";

/// Rewrite a raw `SwiftCompile`/`ObjcCompile` argv into an indexer-ready
/// invocation.
pub fn rewrite_compile_arguments(raw: &[String], req: &RewriteRequest<'_>) -> Vec<String> {
    // The leading wrapper tokens never survive: the worker + `swiftc` pair
    // for Swift, the `clang` launcher for Objective-C.
    let skip = match req.language {
        Language::Swift => 2,
        Language::ObjectiveC => 1,
    };
    // `.mm` is compiled as Objective-C++ and must not be forced to plain
    // Objective-C; only `.m` inputs get the language override and the
    // lone `-c` drop.
    let objc_m_input = req.language == Language::ObjectiveC && req.content_path.ends_with(".m");

    let mut out: Vec<String> = Vec::with_capacity(raw.len() + 4);
    if objc_m_input {
        out.push("-x".to_string());
        out.push("objective-c".to_string());
    }

    let mut iter = raw.iter().skip(skip);
    while let Some(arg) = iter.next() {
        if arg.starts_with("-Xwrapped-swift") {
            continue;
        }
        if arg == "-enable-batch-mode" {
            continue;
        }
        if arg == "-emit-const-values-path" {
            // Two-token flag; the path operand goes with it.
            let _ = iter.next();
            continue;
        }
        if objc_m_input && arg == "-c" {
            continue;
        }
        if req.language == Language::Swift && arg == "-index-store-path" {
            out.push(arg.clone());
            if iter.next().is_some() {
                out.push(req.global_index_store.to_string());
            }
            continue;
        }

        let mut arg = arg.clone();
        if arg.contains("__BAZEL_") {
            arg = arg.replace(PLACEHOLDER_EXECUTION_ROOT, req.root);
            arg = arg.replace(PLACEHOLDER_SDKROOT, req.sdk_root);
            arg = arg.replace(PLACEHOLDER_DEVELOPER_DIR, req.developer_dir);
        }
        arg = rewrite_output_tree_prefixes(arg, req);
        if !arg.starts_with('-') && !arg.starts_with('/') && arg.ends_with(".swift") {
            arg = format!("{}/{}", req.root, arg);
        }
        if let Some(rel) = arg.strip_prefix("-fmodule-map-file=") {
            if !rel.starts_with('/') {
                arg = format!("-fmodule-map-file={}/{}", req.root, rel);
            }
        }
        out.push(arg);
    }

    if req.language == Language::ObjectiveC {
        out.push("-index-store-path".to_string());
        out.push(req.global_index_store.to_string());
        out.push("-working-directory".to_string());
        out.push(req.root.to_string());
    }

    out
}

/// Rewrite `bazel-out/` and `external/` prefixes at the start of an
/// argument or immediately after a `=`. A real user directory with one of
/// these names would be rewritten too; there is no way to tell them apart
/// without a full command-line tokenizer.
fn rewrite_output_tree_prefixes(arg: String, req: &RewriteRequest<'_>) -> String {
    fn rewrite_value(value: &str, req: &RewriteRequest<'_>) -> Option<String> {
        if let Some(rest) = value.strip_prefix("bazel-out/") {
            return Some(format!("{}/{rest}", req.output_path));
        }
        if let Some(rest) = value.strip_prefix("external/") {
            return Some(format!("{}/external/{rest}", req.output_base));
        }
        None
    }

    if let Some(rewritten) = rewrite_value(&arg, req) {
        return rewritten;
    }
    if let Some((flag, value)) = arg.split_once('=') {
        if let Some(rewritten) = rewrite_value(value, req) {
            return format!("{flag}={rewritten}");
        }
    }
    arg
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    fn swift_request(content_path: &'static str) -> RewriteRequest<'static> {
        RewriteRequest {
            language: Language::Swift,
            content_path,
            root: "/ws",
            output_base: "/tmp/ob-kestrel",
            output_path: "/tmp/ob-kestrel/bin",
            developer_dir: "/Applications/Xcode.app/Contents/Developer",
            sdk_root: "/sdks/iPhoneSimulator.sdk",
            global_index_store: "/tmp/ob-kestrel/bin/_global_index_store",
        }
    }

    fn objc_request(content_path: &'static str) -> RewriteRequest<'static> {
        RewriteRequest {
            language: Language::ObjectiveC,
            content_path,
            ..swift_request("")
        }
    }

    #[test]
    fn swift_invocation_is_rewritten_end_to_end() {
        let raw = strings(&[
            "bazel-out/host/bin/worker",
            "swiftc",
            "-Xwrapped-swift=-file-prefix-pwd-is-dot",
            "-sdk",
            "__BAZEL_XCODE_SDKROOT__",
            "App/Lib/A.swift",
            "-index-store-path",
            "bazel-out/ios-sim/bin/idx",
        ]);
        let req = swift_request("App/Lib/A.swift");
        let rewritten = rewrite_compile_arguments(&raw, &req);
        assert_eq!(
            rewritten,
            strings(&[
                "-sdk",
                "/sdks/iPhoneSimulator.sdk",
                "/ws/App/Lib/A.swift",
                "-index-store-path",
                "/tmp/ob-kestrel/bin/_global_index_store",
            ])
        );
    }

    #[test]
    fn rewriting_is_pure() {
        let raw = strings(&[
            "worker",
            "swiftc",
            "-enable-batch-mode",
            "B.swift",
            "-emit-const-values-path",
            "bazel-out/x/values.json",
        ]);
        let req = swift_request("B.swift");
        let first = rewrite_compile_arguments(&raw, &req);
        let second = rewrite_compile_arguments(&raw, &req);
        assert_eq!(first, second);
        assert_eq!(first, strings(&["/ws/B.swift"]));
    }

    #[test]
    fn placeholders_never_survive() {
        let raw = strings(&[
            "worker",
            "swiftc",
            "-I__BAZEL_EXECUTION_ROOT__/Sources",
            "-F",
            "__BAZEL_XCODE_DEVELOPER_DIR__/Platforms",
        ]);
        let rewritten = rewrite_compile_arguments(&raw, &swift_request("A.swift"));
        for arg in &rewritten {
            assert!(!arg.contains("__BAZEL_"), "placeholder survived: {arg}");
        }
        assert_eq!(rewritten[0], "-I/ws/Sources");
        assert_eq!(
            rewritten[2],
            "/Applications/Xcode.app/Contents/Developer/Platforms"
        );
    }

    #[test]
    fn output_tree_prefixes_are_rewritten() {
        let raw = strings(&[
            "worker",
            "swiftc",
            "bazel-out/ios-sim/bin/gen.swift",
            "-Iexternal/SomeDep/include",
            "-vfsoverlay=bazel-out/ios-sim/bin/overlay.yaml",
        ]);
        let rewritten = rewrite_compile_arguments(&raw, &swift_request("A.swift"));
        assert_eq!(rewritten[0], "/tmp/ob-kestrel/bin/ios-sim/bin/gen.swift");
        assert_eq!(rewritten[1], "-Iexternal/SomeDep/include");
        assert_eq!(
            rewritten[2],
            "-vfsoverlay=/tmp/ob-kestrel/bin/ios-sim/bin/overlay.yaml"
        );
    }

    #[test]
    fn bare_external_prefix_is_anchored_to_output_base() {
        let raw = strings(&["worker", "swiftc", "external/Dep/Sources/D.swift"]);
        let rewritten = rewrite_compile_arguments(&raw, &swift_request("A.swift"));
        assert_eq!(
            rewritten,
            strings(&["/tmp/ob-kestrel/external/Dep/Sources/D.swift"])
        );
    }

    #[test]
    fn objc_invocation_gains_language_store_and_working_directory() {
        let raw = strings(&[
            "external/toolchain/clang",
            "-c",
            "App/Impl.m",
            "-fmodule-map-file=App/module.modulemap",
        ]);
        let req = objc_request("App/Impl.m");
        let rewritten = rewrite_compile_arguments(&raw, &req);
        assert_eq!(
            rewritten,
            strings(&[
                "-x",
                "objective-c",
                "App/Impl.m",
                "-fmodule-map-file=/ws/App/module.modulemap",
                "-index-store-path",
                "/tmp/ob-kestrel/bin/_global_index_store",
                "-working-directory",
                "/ws",
            ])
        );
    }

    #[test]
    fn mm_inputs_keep_their_arguments_untouched() {
        // Objective-C++ must not be forced to `-x objective-c`, and its
        // `-c` stays; only the index-store/working-directory tail applies.
        let raw = strings(&["clang", "-c", "App/Impl.mm"]);
        let req = objc_request("App/Impl.mm");
        let rewritten = rewrite_compile_arguments(&raw, &req);
        assert_eq!(
            rewritten,
            strings(&[
                "-c",
                "App/Impl.mm",
                "-index-store-path",
                "/tmp/ob-kestrel/bin/_global_index_store",
                "-working-directory",
                "/ws",
            ])
        );
    }

    #[test]
    fn absolute_modulemap_values_are_left_alone() {
        let raw = strings(&["clang", "-fmodule-map-file=/abs/module.modulemap"]);
        let rewritten = rewrite_compile_arguments(&raw, &objc_request("App/Impl.m"));
        assert!(rewritten.contains(&"-fmodule-map-file=/abs/module.modulemap".to_string()));
    }

    #[test]
    fn swift_without_index_store_flag_is_not_given_one_mid_stream() {
        let raw = strings(&["worker", "swiftc", "A.swift"]);
        let rewritten = rewrite_compile_arguments(&raw, &swift_request("A.swift"));
        assert_eq!(rewritten, strings(&["/ws/A.swift"]));
    }

    #[test]
    fn language_inference_matches_extensions() {
        assert_eq!(Language::of_source_path("A.swift"), Some(Language::Swift));
        assert_eq!(Language::of_source_path("A.m"), Some(Language::ObjectiveC));
        assert_eq!(Language::of_source_path("A.mm"), Some(Language::ObjectiveC));
        assert_eq!(Language::of_source_path("A.h"), None);
    }
}
