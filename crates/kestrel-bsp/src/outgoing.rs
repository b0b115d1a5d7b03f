//! The single writer for everything the server sends.
//!
//! Replies and notifications can originate from any thread (handlers,
//! termination callbacks, the watch debouncer), so every frame goes
//! through one mutex-guarded writer. Write failures are logged and
//! swallowed; a closed transport is handled by the reader loop, not here.

use crate::codec;
use crate::rpc::{RequestId, RpcError};
use kestrel_core::lock;
use serde::Serialize;
use serde_json::json;
use std::io::Write;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct Outgoing {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Outgoing {
    pub fn stdout() -> Self {
        Self::from_writer(Box::new(std::io::stdout()))
    }

    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    pub fn respond_ok(&self, id: &RequestId, result: impl Serialize) {
        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result,
        });
        self.send(&message);
    }

    pub fn respond_err(&self, id: &RequestId, error: &RpcError) {
        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": error.code(),
                "message": error.to_string(),
            },
        });
        self.send(&message);
    }

    pub fn notify(&self, method: &str, params: impl Serialize) {
        let message = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.send(&message);
    }

    fn send(&self, message: &serde_json::Value) {
        let bytes = match serde_json::to_vec(message) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(
                    target = "kestrel.bsp",
                    error = %err,
                    "failed to serialize outgoing message"
                );
                return;
            }
        };
        let mut writer = lock(&self.writer, "Outgoing.send");
        if let Err(err) = codec::write_raw_message(&mut *writer, &bytes) {
            tracing::error!(
                target = "kestrel.bsp",
                error = %err,
                "failed to write outgoing message"
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::io::{self, BufReader, Cursor};

    /// A writer whose frames can be read back in tests.
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuffer {
        pub(crate) bytes: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.bytes.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        pub(crate) fn decoded_messages(&self) -> Vec<serde_json::Value> {
            let bytes = self.bytes.lock().unwrap().clone();
            let mut reader = BufReader::new(Cursor::new(bytes));
            let mut out = Vec::new();
            while let Some(message) =
                codec::read_json_message::<_, serde_json::Value>(&mut reader).unwrap()
            {
                out.push(message);
            }
            out
        }
    }
}
