//! Shared message types and helpers for the integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use network_engine::{MessageReader, MessageWriter, NetworkMessage, Result, Serializable};

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

#[derive(Debug, Clone, PartialEq)]
pub struct Greeting {
    pub text: String,
}

impl Serializable for Greeting {
    fn write_to(&self, writer: &mut MessageWriter) -> Result<()> {
        writer.write_string(&self.text)
    }

    fn read_from(reader: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Self {
            text: reader.read_string()?,
        })
    }
}

impl NetworkMessage for Greeting {
    const MESSAGE_ID: u16 = 1;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Number {
    pub value: i32,
}

impl Serializable for Number {
    fn write_to(&self, writer: &mut MessageWriter) -> Result<()> {
        writer.write_i32(self.value);
        Ok(())
    }

    fn read_from(reader: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Self {
            value: reader.read_i32()?,
        })
    }
}

impl NetworkMessage for Number {
    const MESSAGE_ID: u16 = 2;
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Await `future` for at most five seconds.
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}
