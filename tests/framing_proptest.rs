//! Chunking must never change what the decoder produces

use agentlink::transport::framer::MessageDecoder;
use agentlink::transport::protocol::Message;
use proptest::prelude::*;

fn stream(texts: &[String]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for (i, text) in texts.iter().enumerate() {
        let line = if i % 2 == 0 {
            serde_json::json!({"jsonrpc": "2.0", "method": "log", "params": {"text": text}})
        } else {
            serde_json::json!({"jsonrpc": "2.0", "id": i, "result": text})
        };
        bytes.extend_from_slice(line.to_string().as_bytes());
        bytes.extend_from_slice(if i % 3 == 0 { b"\r\n" } else { b"\n" });
    }
    bytes
}

fn decode(bytes: &[u8], cuts: &[usize]) -> Vec<String> {
    let mut decoder = MessageDecoder::new();
    let mut out = Vec::new();
    let mut start = 0;
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (bytes.len() + 1)).collect();
    points.sort_unstable();
    points.push(bytes.len());
    for end in points {
        out.extend(decoder.feed(&bytes[start..end]));
        start = end;
    }
    out.into_iter()
        .map(|item| match item {
            Ok(Message::Notification(n)) => format!("note:{}", n.params.unwrap_or_default()),
            Ok(Message::Response(r)) => format!("resp:{:?}", r.outcome),
            Ok(other) => format!("other:{:?}", other),
            Err(e) => format!("err:{}", e),
        })
        .collect()
}

proptest! {
    #[test]
    fn test_split_points_do_not_matter(
        texts in prop::collection::vec("\\PC{0,24}", 1..8),
        cuts in prop::collection::vec(any::<usize>(), 0..12),
    ) {
        let bytes = stream(&texts);
        let whole = decode(&bytes, &[]);
        prop_assert_eq!(whole.len(), texts.len());
        prop_assert_eq!(decode(&bytes, &cuts), whole);
    }

    #[test]
    fn test_byte_at_a_time_matches_whole(texts in prop::collection::vec("[a-zé日 ]{0,16}", 1..5)) {
        let bytes = stream(&texts);
        let cuts: Vec<usize> = (0..bytes.len()).collect();
        prop_assert_eq!(decode(&bytes, &cuts), decode(&bytes, &[]));
    }
}
