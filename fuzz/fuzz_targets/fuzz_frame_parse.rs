#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use network_engine::protocol::wire::FrameCodec;
use network_engine::protocol::{MessageParsingOutput, WireProtocol};
use network_engine::{MessageReader, MessageWriter, NetworkMessage, Registry, Result, Serializable};

struct Text(String);

impl Serializable for Text {
    fn write_to(&self, writer: &mut MessageWriter) -> Result<()> {
        writer.write_string(&self.0)
    }

    fn read_from(reader: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Text(reader.read_string()?))
    }
}

impl NetworkMessage for Text {
    const MESSAGE_ID: u16 = 1;
}

fuzz_target!(|data: &[u8]| {
    // Fuzz length-prefixed framing - panics, runaway allocation, infinite loops
    let Ok(registry) = Registry::builder().message::<Text>().build() else {
        return;
    };
    let mut codec = FrameCodec::new(registry, 64 * 1024);
    let mut src = BytesMut::from(data);
    let _ = codec.try_parse(&mut src, &mut MessageParsingOutput::default());
});
