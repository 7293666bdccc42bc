//! Building queries and parsing replies.
//!
//! One query datagram asks for the A records of a single host name;
//! one reply datagram answers it. Everything uses the classic wire
//! format: a twelve octet header, a question section with the name as
//! length-prefixed labels, and resource records whose names may be
//! compressed into pointers. The datagram size is capped at 512
//! octets, which the 253 octet limit on host names guarantees a query
//! can never exceed.

use std::fmt;
use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, BytesMut};

/// The largest datagram we send or accept.
pub(crate) const MAX_DATAGRAM: usize = 512;

/// The longest acceptable host name.
pub(crate) const MAX_NAME: usize = 253;

/// The longest acceptable label within a host name.
const MAX_LABEL: usize = 63;

/// The header bit marking a message as a response.
const FLAG_RESPONSE: u16 = 0x8000;

/// The header flags of a standard query with recursion desired.
const FLAGS_QUERY: u16 = 0x0100;

/// The mask of the response code in the header flags.
const RCODE_MASK: u16 = 0x000F;

/// The record type of an IPv4 host address.
const TYPE_A: u16 = 1;

/// The record class of the Internet.
const CLASS_IN: u16 = 1;

//------------ Host name checking --------------------------------------------

/// Checks that a host name can be encoded into a question.
///
/// A name consists of dot-separated labels of 1 to 63 octets each and
/// is at most 253 octets overall. A single trailing dot is allowed and
/// ignored.
pub(crate) fn check_name(name: &str) -> Result<(), NameError> {
    if name.len() > MAX_NAME {
        return Err(NameError::TooLong);
    }
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() {
        return Err(NameError::EmptyLabel);
    }
    for label in name.split('.') {
        if label.is_empty() {
            return Err(NameError::EmptyLabel);
        }
        if label.len() > MAX_LABEL {
            return Err(NameError::LongLabel);
        }
    }
    Ok(())
}

//------------ Query building ------------------------------------------------

/// Builds the query datagram for the A records of `name`.
///
/// The name must have passed [`check_name`].
pub(crate) fn build_query(id: u16, name: &str) -> BytesMut {
    debug_assert!(check_name(name).is_ok());
    let mut buf = BytesMut::with_capacity(MAX_DATAGRAM);
    buf.put_u16(id);
    buf.put_u16(FLAGS_QUERY);
    buf.put_u16(1); // questions
    buf.put_u16(0); // answers
    buf.put_u16(0); // authority records
    buf.put_u16(0); // additional records
    let name = name.strip_suffix('.').unwrap_or(name);
    for label in name.split('.') {
        buf.put_u8(label.len() as u8);
        buf.put_slice(label.as_bytes());
    }
    buf.put_u8(0);
    buf.put_u16(TYPE_A);
    buf.put_u16(CLASS_IN);
    buf
}

//------------ Reply parsing -------------------------------------------------

/// Extracts the transaction id of a datagram.
///
/// Returns `None` if the datagram is too short to even carry one.
pub(crate) fn reply_id(packet: &[u8]) -> Option<u16> {
    if packet.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([packet[0], packet[1]]))
}

/// Parses a reply datagram down to the first IPv4 address it answers.
///
/// The reply must be a response with a zero response code and must
/// contain at least one answer of type A in class IN; the first such
/// answer wins. Anything else fails.
pub(crate) fn parse_reply(
    packet: &[u8],
) -> Result<Ipv4Addr, ReplyError> {
    let mut buf = packet;
    need(&buf, 12)?;
    let _id = buf.get_u16();
    let flags = buf.get_u16();
    if flags & FLAG_RESPONSE == 0 {
        return Err(ReplyError::NotResponse);
    }
    let rcode = (flags & RCODE_MASK) as u8;
    if rcode != 0 {
        return Err(ReplyError::Rcode(rcode));
    }
    let questions = buf.get_u16();
    let answers = buf.get_u16();
    let _authority = buf.get_u16();
    let _additional = buf.get_u16();
    if answers == 0 {
        return Err(ReplyError::NoAddress);
    }
    for _ in 0..questions {
        skip_name(&mut buf)?;
        need(&buf, 4)?;
        buf.advance(4);
    }
    for _ in 0..answers {
        skip_name(&mut buf)?;
        need(&buf, 10)?;
        let rtype = buf.get_u16();
        let class = buf.get_u16();
        let _ttl = buf.get_u32();
        let rdlen = buf.get_u16() as usize;
        need(&buf, rdlen)?;
        if rtype == TYPE_A && class == CLASS_IN {
            if rdlen != 4 {
                return Err(ReplyError::Malformed);
            }
            return Ok(Ipv4Addr::from(buf.get_u32()));
        }
        buf.advance(rdlen);
    }
    Err(ReplyError::NoAddress)
}

/// Skips over one possibly compressed name.
fn skip_name(buf: &mut &[u8]) -> Result<(), ReplyError> {
    loop {
        need(buf, 1)?;
        let len = buf.get_u8();
        if len == 0 {
            return Ok(());
        }
        match len & 0xC0 {
            // A pointer ends the name.
            0xC0 => {
                need(buf, 1)?;
                buf.advance(1);
                return Ok(());
            }
            0x00 => {
                need(buf, usize::from(len))?;
                buf.advance(usize::from(len));
            }
            _ => return Err(ReplyError::Malformed),
        }
    }
}

/// Checks that at least `len` octets are left.
fn need(buf: &&[u8], len: usize) -> Result<(), ReplyError> {
    if buf.remaining() < len {
        Err(ReplyError::Malformed)
    } else {
        Ok(())
    }
}

//------------ NameError -----------------------------------------------------

/// A host name cannot be encoded into a question.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum NameError {
    /// The name is longer than 253 octets.
    TooLong,

    /// A label exceeds 63 octets.
    LongLabel,

    /// The name is empty or contains an empty label.
    EmptyLabel,
}

//------------ ReplyError ----------------------------------------------------

/// A reply datagram did not produce an address.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ReplyError {
    /// The datagram is truncated or structurally broken.
    Malformed,

    /// The response bit is not set.
    NotResponse,

    /// The server reported the given non-zero response code.
    Rcode(u8),

    /// There is no A record in class IN among the answers.
    NoAddress,
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ReplyError::Malformed => f.write_str("malformed reply"),
            ReplyError::NotResponse => {
                f.write_str("reply is not a response")
            }
            ReplyError::Rcode(code) => {
                write!(f, "server failure, rcode {}", code)
            }
            ReplyError::NoAddress => {
                f.write_str("reply carries no address")
            }
        }
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    /// Decodes the question name of a query built by `build_query`.
    fn decode_question_name(packet: &[u8]) -> String {
        let mut pos = 12;
        let mut labels = Vec::new();
        loop {
            let len = usize::from(packet[pos]);
            pos += 1;
            if len == 0 {
                break;
            }
            labels.push(
                std::str::from_utf8(&packet[pos..pos + len])
                    .unwrap()
                    .to_string(),
            );
            pos += len;
        }
        labels.join(".")
    }

    /// Builds a reply to `query` answering with `addr`.
    ///
    /// The answer name is compressed into a pointer at the question.
    fn build_reply(query: &[u8], addr: Ipv4Addr) -> Vec<u8> {
        let mut reply = Vec::new();
        reply.extend_from_slice(&query[..2]); // id
        reply.extend_from_slice(&0x8180u16.to_be_bytes());
        reply.extend_from_slice(&1u16.to_be_bytes()); // questions
        reply.extend_from_slice(&1u16.to_be_bytes()); // answers
        reply.extend_from_slice(&0u16.to_be_bytes());
        reply.extend_from_slice(&0u16.to_be_bytes());
        reply.extend_from_slice(&query[12..]); // question section
        reply.extend_from_slice(&0xC00Cu16.to_be_bytes()); // name ptr
        reply.extend_from_slice(&1u16.to_be_bytes()); // type A
        reply.extend_from_slice(&1u16.to_be_bytes()); // class IN
        reply.extend_from_slice(&60u32.to_be_bytes()); // ttl
        reply.extend_from_slice(&4u16.to_be_bytes()); // rdlength
        reply.extend_from_slice(&addr.octets());
        reply
    }

    #[test]
    fn query_layout() {
        let packet = build_query(0x1234, "ya.ru");
        assert_eq!(
            packet.as_ref(),
            &[
                0x12, 0x34, // id
                0x01, 0x00, // flags
                0x00, 0x01, // questions
                0x00, 0x00, // answers
                0x00, 0x00, // authority
                0x00, 0x00, // additional
                2, b'y', b'a', 2, b'r', b'u', 0, // name
                0x00, 0x01, // type A
                0x00, 0x01, // class IN
            ][..]
        );
    }

    #[test]
    fn name_round_trip() {
        for name in ["ya.ru", "www.example.com", "localhost"] {
            let packet = build_query(1, name);
            assert_eq!(decode_question_name(&packet), name);
        }
        // A trailing dot encodes like the dotless form.
        let packet = build_query(1, "ya.ru.");
        assert_eq!(decode_question_name(&packet), "ya.ru");
    }

    #[test]
    fn name_length_limits() {
        // 63 labels of "abc." plus "a" make 253 octets.
        let max = "abc.".repeat(63) + "a";
        assert_eq!(max.len(), 253);
        assert_eq!(check_name(&max), Ok(()));
        let over = "abc.".repeat(63) + "ab";
        assert_eq!(over.len(), 254);
        assert_eq!(check_name(&over), Err(NameError::TooLong));
    }

    #[test]
    fn label_length_limits() {
        let max = "a".repeat(63);
        assert_eq!(check_name(&max), Ok(()));
        let over = "a".repeat(64);
        assert_eq!(check_name(&over), Err(NameError::LongLabel));
    }

    #[test]
    fn empty_labels_are_rejected() {
        assert_eq!(check_name(""), Err(NameError::EmptyLabel));
        assert_eq!(check_name("."), Err(NameError::EmptyLabel));
        assert_eq!(check_name("ya..ru"), Err(NameError::EmptyLabel));
        assert_eq!(check_name(".ya.ru"), Err(NameError::EmptyLabel));
        // A single trailing dot is fine.
        assert_eq!(check_name("ya.ru."), Ok(()));
    }

    #[test]
    fn reply_round_trip() {
        let addr = Ipv4Addr::new(77, 88, 21, 3);
        let query = build_query(7, "ya.ru");
        let reply = build_reply(&query, addr);
        assert_eq!(reply_id(&reply), Some(7));
        assert_eq!(parse_reply(&reply), Ok(addr));
        assert_eq!(u32::from(addr), 0x4D58_1503);
    }

    #[test]
    fn reply_errors() {
        let query = build_query(7, "ya.ru");
        // A query is not a response.
        assert_eq!(
            parse_reply(&query),
            Err(ReplyError::NotResponse)
        );

        let addr = Ipv4Addr::new(1, 2, 3, 4);
        let mut reply = build_reply(&query, addr);
        // NXDOMAIN.
        reply[3] = 0x83;
        assert_eq!(parse_reply(&reply), Err(ReplyError::Rcode(3)));

        // No answers.
        let mut reply = build_reply(&query, addr);
        reply[7] = 0;
        assert_eq!(parse_reply(&reply), Err(ReplyError::NoAddress));

        // Truncated mid-answer.
        let reply = build_reply(&query, addr);
        assert_eq!(
            parse_reply(&reply[..reply.len() - 2]),
            Err(ReplyError::Malformed)
        );

        // Too short for an id at all.
        assert_eq!(reply_id(&[0x12]), None);
    }

    #[test]
    fn first_a_record_wins_over_other_types() {
        let addr = Ipv4Addr::new(9, 9, 9, 9);
        let query = build_query(3, "ya.ru");
        let mut reply = Vec::new();
        reply.extend_from_slice(&query[..2]);
        reply.extend_from_slice(&0x8180u16.to_be_bytes());
        reply.extend_from_slice(&1u16.to_be_bytes());
        reply.extend_from_slice(&2u16.to_be_bytes()); // two answers
        reply.extend_from_slice(&0u16.to_be_bytes());
        reply.extend_from_slice(&0u16.to_be_bytes());
        reply.extend_from_slice(&query[12..]);
        // First answer: a CNAME, skipped over.
        reply.extend_from_slice(&0xC00Cu16.to_be_bytes());
        reply.extend_from_slice(&5u16.to_be_bytes()); // type CNAME
        reply.extend_from_slice(&1u16.to_be_bytes());
        reply.extend_from_slice(&60u32.to_be_bytes());
        reply.extend_from_slice(&2u16.to_be_bytes());
        reply.extend_from_slice(&[1, b'x']);
        // Second answer: the address.
        reply.extend_from_slice(&0xC00Cu16.to_be_bytes());
        reply.extend_from_slice(&1u16.to_be_bytes());
        reply.extend_from_slice(&1u16.to_be_bytes());
        reply.extend_from_slice(&60u32.to_be_bytes());
        reply.extend_from_slice(&4u16.to_be_bytes());
        reply.extend_from_slice(&addr.octets());
        assert_eq!(parse_reply(&reply), Ok(addr));
    }
}
