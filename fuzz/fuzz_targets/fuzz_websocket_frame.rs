#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use network_engine::protocol::websocket::WebSocketCodec;
use network_engine::protocol::{MessageParsingOutput, WireProtocol};
use network_engine::{MessageReader, MessageWriter, NetworkMessage, Registry, Result, Serializable};

struct Value(u64);

impl Serializable for Value {
    fn write_to(&self, writer: &mut MessageWriter) -> Result<()> {
        writer.write_u64(self.0);
        Ok(())
    }

    fn read_from(reader: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Value(reader.read_u64()?))
    }
}

impl NetworkMessage for Value {
    const MESSAGE_ID: u16 = 1;
}

fuzz_target!(|data: &[u8]| {
    // Fuzz RFC 6455 frame decoding on the accepting side
    let Ok(registry) = Registry::builder().message::<Value>().build() else {
        return;
    };
    let mut codec = WebSocketCodec::server(registry, 64 * 1024);
    let mut src = BytesMut::from(data);
    let _ = codec.try_parse(&mut src, &mut MessageParsingOutput::default());
});
