//! On-disk framing for intermediate shards.
//!
//! A shard is a stream of JSON-encoded [`KeyValue`] records. The format is
//! self-describing and safe for keys and values containing embedded control
//! characters, and a decoder reading a truncated shard simply observes a
//! shorter stream.

use std::io::{BufWriter, Read, Write};

use anyhow::Result;

use crate::KeyValue;

/// Serialize `records` to `writer`, one JSON value per line.
pub fn write_records<W: Write>(writer: W, records: &[KeyValue]) -> Result<()> {
    let mut writer = BufWriter::new(writer);
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Decode a shard back into records.
///
/// Decoding stops at the first malformed value, so a truncated shard is
/// read as end-of-stream rather than an error.
pub fn read_records<R: Read>(reader: R) -> impl Iterator<Item = KeyValue> {
    serde_json::Deserializer::from_reader(reader)
        .into_iter::<KeyValue>()
        .map_while(|record| record.ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn sample() -> Vec<KeyValue> {
        vec![
            KeyValue::new(Bytes::from("apple"), Bytes::from("1")),
            KeyValue::new(Bytes::from("pear\nwith newline"), Bytes::from("2")),
            KeyValue::new(Bytes::from(&b"\x00binary\xff"[..]), Bytes::from("3")),
        ]
    }

    #[test]
    fn records_round_trip() {
        let mut buf = Vec::new();
        write_records(&mut buf, &sample()).unwrap();
        let decoded: Vec<KeyValue> = read_records(&buf[..]).collect();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn truncated_shard_reads_as_prefix() {
        let mut buf = Vec::new();
        write_records(&mut buf, &sample()).unwrap();
        // Chop the stream in the middle of the last record.
        buf.truncate(buf.len() - 5);
        let decoded: Vec<KeyValue> = read_records(&buf[..]).collect();
        assert_eq!(decoded, sample()[..2]);
    }

    #[test]
    fn empty_shard_decodes_to_nothing() {
        assert_eq!(read_records(&[][..]).count(), 0);
    }
}
