//! Basic types for dnsguard

use anyhow::Result;
use hickory_proto::op::{Message, MessageType, Query};
use hickory_proto::rr::{Name, RecordType};
use std::net::{Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto { Udp, Tcp }

impl Proto {
    pub fn as_str(&self) -> &'static str {
        match self { Proto::Udp => "udp", Proto::Tcp => "tcp" }
    }
}

/// How a filtered request is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockingMode {
    /// Use the IP from the matched rule, otherwise behave like `NullIp`.
    #[default]
    Default,
    NullIp,
    CustomIp { ipv4: Ipv4Addr, ipv6: Ipv6Addr },
    NxDomain,
    Refused,
}

impl BlockingMode {
    pub fn parse(mode: &str, args: &[String]) -> Result<Self> {
        match mode.to_lowercase().as_str() {
            "default" => Ok(BlockingMode::Default),
            "null_ip" => Ok(BlockingMode::NullIp),
            "nxdomain" => Ok(BlockingMode::NxDomain),
            "refused" => Ok(BlockingMode::Refused),
            "custom_ip" => {
                if args.len() < 2 { anyhow::bail!("custom_ip blocking mode needs an IPv4 and an IPv6 address"); }
                let ipv4 = args[0].parse::<Ipv4Addr>()
                    .map_err(|_| anyhow::anyhow!("invalid custom blocking IPv4 address '{}'", args[0]))?;
                let ipv6 = args[1].parse::<Ipv6Addr>()
                    .map_err(|_| anyhow::anyhow!("invalid custom blocking IPv6 address '{}'", args[1]))?;
                Ok(BlockingMode::CustomIp { ipv4, ipv6 })
            }
            _ => anyhow::bail!("unknown blocking mode: {}", mode),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockingMode::Default => "default",
            BlockingMode::NullIp => "null_ip",
            BlockingMode::CustomIp { .. } => "custom_ip",
            BlockingMode::NxDomain => "nxdomain",
            BlockingMode::Refused => "refused",
        }
    }
}

/// Reply shell for `req`: same id, opcode, RD/CD flags and question, QR set.
pub fn make_reply(req: &Message) -> Message {
    let mut resp = Message::new();
    resp.set_id(req.id())
        .set_message_type(MessageType::Response)
        .set_op_code(req.op_code())
        .set_recursion_desired(req.recursion_desired())
        .set_checking_disabled(req.checking_disabled());
    if let Some(q) = req.queries().first() {
        resp.add_query(q.clone());
    }
    resp
}

pub fn first_question(msg: &Message) -> Option<&Query> {
    msg.queries().first()
}

/// Host name of a question without the trailing dot.
pub fn host_of(name: &Name) -> String {
    let s = name.to_ascii();
    s.strip_suffix('.').unwrap_or(&s).to_string()
}

/// Parses `host` as a fully qualified domain name.
pub fn fqdn(host: &str) -> Result<Name> {
    let mut name = Name::from_ascii(host)
        .map_err(|e| anyhow::anyhow!("invalid domain name '{}': {}", host, e))?;
    name.set_fqdn(true);
    Ok(name)
}

pub fn is_address_query(qtype: RecordType) -> bool {
    qtype == RecordType::A || qtype == RecordType::AAAA
}

/// Swaps the question of `msg` for `q`.
pub fn replace_question(msg: &mut Message, q: Query) {
    let _ = msg.take_queries();
    msg.add_query(q);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::OpCode;

    #[test]
    fn reply_copies_id_and_question() {
        let mut req = Message::new();
        req.set_id(0x1234).set_op_code(OpCode::Query).set_recursion_desired(true);
        req.add_query(Query::query(fqdn("example.com").unwrap(), RecordType::A));

        let resp = make_reply(&req);
        assert_eq!(resp.id(), 0x1234);
        assert_eq!(resp.message_type(), MessageType::Response);
        assert!(resp.recursion_desired());
        assert_eq!(resp.queries().len(), 1);
        assert_eq!(resp.queries()[0].name().to_ascii(), "example.com.");
    }

    #[test]
    fn host_strips_trailing_dot() {
        assert_eq!(host_of(&fqdn("Ads.Example.com").unwrap()), "Ads.Example.com");
        assert_eq!(host_of(&Name::root()), "");
    }

    #[test]
    fn blocking_mode_parsing() {
        assert_eq!(BlockingMode::parse("nxdomain", &[]).unwrap(), BlockingMode::NxDomain);
        assert_eq!(BlockingMode::parse("NULL_IP", &[]).unwrap(), BlockingMode::NullIp);
        let custom = BlockingMode::parse("custom_ip", &["10.0.0.1".into(), "::1".into()]).unwrap();
        assert_eq!(custom, BlockingMode::CustomIp { ipv4: Ipv4Addr::new(10, 0, 0, 1), ipv6: Ipv6Addr::LOCALHOST });
        assert!(BlockingMode::parse("custom_ip", &["10.0.0.1".into()]).is_err());
        assert!(BlockingMode::parse("drop", &[]).is_err());
    }
}
