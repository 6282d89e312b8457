//! Shared helpers for the end-to-end protocol tests: a minimal controller
//! that speaks the JSON wire format over a raw TCP stream.

#![allow(dead_code)]

use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use vcap::config::Settings;
use vcap::device::Device;
use vcap::error::VcapResult;
use vcap::protocol::{Command, FrameBuffer, ParameterMap, WireFrame};
use vcap::transport::TransportListener;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_settings() -> Settings {
    Settings {
        port: 0,
        log_level: "debug".to_string(),
        device_name: "TestDevice".to_string(),
    }
}

pub fn params(key: &str, value: serde_json::Value) -> ParameterMap {
    let mut map = ParameterMap::new();
    map.insert(key.to_string(), value);
    map
}

/// Binds an ephemeral port and serves `device` on it in the background.
pub async fn spawn_device(device: Device) -> (SocketAddr, JoinHandle<VcapResult<()>>) {
    let listener = TransportListener::bind(0).await.expect("bind listener");
    let port = listener.local_addr().expect("local addr").port();
    let handle = tokio::spawn(async move { device.serve_on(listener).await });
    (SocketAddr::from(([127, 0, 0, 1], port)), handle)
}

/// Controller side of the protocol: one TCP stream plus frame reassembly.
pub struct Controller {
    stream: TcpStream,
    buffer: FrameBuffer,
}

impl Controller {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect to device");
        Self {
            stream,
            buffer: FrameBuffer::new(),
        }
    }

    pub async fn send_command(&mut self, command: &Command) {
        let bytes = command.to_bytes().expect("serialize command");
        self.send_raw(&bytes).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("send bytes");
    }

    /// Receives the next command frame, failing the test after
    /// [`RECV_TIMEOUT`].
    pub async fn recv_command(&mut self) -> Command {
        self.try_recv_command(RECV_TIMEOUT)
            .await
            .expect("timed out waiting for a frame")
    }

    /// Like [`Controller::recv_command`] but returns `None` when nothing
    /// arrives within `wait`.
    pub async fn try_recv_command(&mut self, wait: Duration) -> Option<Command> {
        loop {
            if let Some(frame) = self.buffer.next_frame() {
                match frame {
                    WireFrame::Json(bytes) => {
                        return Some(Command::from_slice(&bytes).expect("parse frame"));
                    }
                    WireFrame::Kill => continue,
                }
            }
            let mut chunk = [0u8; 4096];
            let n = match timeout(wait, self.stream.read(&mut chunk)).await {
                Ok(read) => read.expect("read from device"),
                Err(_) => return None,
            };
            assert!(n > 0, "device closed the connection mid-wait");
            self.buffer.extend(&chunk[..n]);
        }
    }

    /// Asserts the device closes the connection.
    pub async fn expect_closed(&mut self) {
        let mut chunk = [0u8; 4096];
        loop {
            let n = timeout(RECV_TIMEOUT, self.stream.read(&mut chunk))
                .await
                .expect("timed out waiting for the connection to close")
                .expect("read from device");
            if n == 0 {
                return;
            }
        }
    }
}
