use crate::protocol::records::{CalcMessage, CalcProtocol};
use crate::protocol::text;

/// What an incoming datagram turned out to be. Classification is a pure
///  function of the payload: length first, then header validity, with printable
///  text as the only fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classified {
    /// a 12-byte control record with a 1.1 version header (handshake or ack probe)
    Message(CalcMessage),
    /// a 26-byte task / answer record: version 1.1, or the all-zero probe
    Record(CalcProtocol),
    TextHandshake,
    TextAnswer { id: u32, result: i64 },
    /// anything else: wrong size, bad magic, non-printable bytes, unparsable text
    Malformed,
}

pub fn classify(payload: &[u8]) -> Classified {
    if payload.len() == CalcMessage::SERIALIZED_LEN {
        if let Ok(msg) = CalcMessage::try_deser(payload) {
            // "TEXT UDP 1.1" is also exactly 12 bytes, so a valid version
            //  header is required before the payload counts as binary
            if msg.version_matches() {
                return Classified::Message(msg);
            }
        }
    }

    if payload.len() == CalcProtocol::SERIALIZED_LEN {
        if let Ok(record) = CalcProtocol::try_deser(payload) {
            if record.version_matches() || record.is_all_zero() {
                return Classified::Record(record);
            }
        }
    }

    classify_as_text(payload)
}

fn classify_as_text(payload: &[u8]) -> Classified {
    if payload.is_empty() || !payload.iter().all(|&b| is_text_byte(b)) {
        return Classified::Malformed;
    }

    // validity was checked byte-wise above
    let line = match std::str::from_utf8(payload) {
        Ok(s) => s,
        Err(_) => return Classified::Malformed,
    };

    if text::is_udp_handshake(line) {
        return Classified::TextHandshake;
    }
    match text::parse_answer_line(line) {
        Ok((id, result)) => Classified::TextAnswer { id, result },
        Err(_) => Classified::Malformed,
    }
}

fn is_text_byte(b: u8) -> bool {
    (0x20..=0x7e).contains(&b) || b == b'\r' || b == b'\n'
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use crate::protocol::records::{CalcMessage, CalcProtocol};

    use super::*;

    #[test]
    fn test_classify_client_hello() {
        let payload = CalcMessage::client_hello().encode();
        assert_eq!(classify(&payload), Classified::Message(CalcMessage::client_hello()));
    }

    #[test]
    fn test_classify_answer_record() {
        let record = CalcProtocol::answer(0x2a, 1, 3, 4, 7);
        match classify(&record.encode()) {
            Classified::Record(r) => assert_eq!(r, record),
            other => panic!("expected a record, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_all_zero_record() {
        match classify(&[0u8; 26]) {
            Classified::Record(r) => assert!(r.is_all_zero()),
            other => panic!("expected the all-zero record, got {:?}", other),
        }
    }

    #[test]
    fn test_text_handshake_is_not_binary() {
        // 12 ASCII bytes, same length as a CalcMessage
        let payload = b"TEXT UDP 1.1";
        assert_eq!(payload.len(), CalcMessage::SERIALIZED_LEN);
        assert_eq!(classify(payload), Classified::TextHandshake);
    }

    #[test]
    fn test_classify_text_answer() {
        assert_eq!(classify(b"7 30\n"), Classified::TextAnswer { id: 7, result: 30 });
    }

    #[rstest]
    #[case::empty(&[][..])]
    #[case::odd_length_garbage(&[0u8; 20][..])]
    #[case::non_printable(&[1u8, 2, 3, 4, 5][..])]
    #[case::unparsable_text(&b"hello there"[..])]
    #[case::twelve_byte_garbage(&[0xffu8; 12][..])]
    #[case::twenty_six_byte_bad_version(&[0xffu8; 26][..])]
    fn test_classify_malformed(#[case] payload: &[u8]) {
        assert_eq!(classify(payload), Classified::Malformed);
    }

    #[test]
    fn test_version_mismatch_is_not_binary() {
        let mut msg = CalcMessage::client_hello();
        msg.major_version = 2;
        // not a valid 1.1 header and not printable text either
        assert_eq!(classify(&msg.encode()), Classified::Malformed);
    }
}
