use anyhow::{Context, Result};
use hickory_proto::op::{Edns, Message};
use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsCode, EdnsOption};
use ipnet::IpNet;

// UDP payload size advertised on a freshly created OPT record.
const EDNS_UDP_SIZE: u16 = 4096;

/// Parses an ECS subnet in `ip/prefix` notation. The address is masked to
/// the prefix so only significant bits go on the wire, the scope prefix is 0
/// as RFC 7871 requires for queries, and the family follows the address.
pub fn parse_subnet(s: &str) -> Result<ClientSubnet> {
    let net: IpNet = s
        .trim()
        .parse()
        .with_context(|| format!("invalid ECS subnet [{s}], expected ip/prefix"))?;
    Ok(ClientSubnet::new(net.network(), net.prefix_len(), 0))
}

/// Appends `subnet` to the query unless one is already present.
///
/// Returns `Some(copy)` when the query was extended; the copy is deep, the
/// input is never mutated. Returns `None` when the query already carries a
/// Subnet option, which preserves client-supplied ECS and makes the
/// operation idempotent.
pub fn append_ecs_if_absent(q: &Message, subnet: &ClientSubnet) -> Option<Message> {
    if let Some(edns) = q.extensions() {
        if edns.option(EdnsCode::Subnet).is_some() {
            return None;
        }
    }

    let had_opt = q.extensions().is_some();
    let mut copy = q.clone();
    let edns = copy.extensions_mut().get_or_insert_with(Edns::new);
    if !had_opt {
        edns.set_max_payload(EDNS_UDP_SIZE);
        edns.set_version(0);
    }
    edns.options_mut()
        .insert(EdnsOption::Subnet(subnet.clone()));
    Some(copy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RecordType};
    use hickory_proto::serialize::binary::BinEncodable;
    use std::str::FromStr;

    fn test_query() -> Message {
        let mut q = Message::new();
        q.set_id(0x4d2);
        q.add_query(Query::query(
            Name::from_str("www.example.com.").expect("name"),
            RecordType::A,
        ));
        q
    }

    fn cn_subnet() -> ClientSubnet {
        parse_subnet("1.2.4.0/24").expect("subnet")
    }

    #[test]
    fn parse_masks_host_bits() {
        let subnet = parse_subnet("1.2.4.99/24").expect("subnet");
        assert_eq!(subnet, cn_subnet());
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(parse_subnet("1.2.3.4").is_err()); // no prefix
        assert!(parse_subnet("1.2.3.4/33").is_err());
        assert!(parse_subnet("2001:db8::/129").is_err());
        assert!(parse_subnet("hello/24").is_err());
    }

    #[test]
    fn parse_accepts_both_families() {
        assert!(parse_subnet("12.34.56.0/24").is_ok());
        assert!(parse_subnet("2001:db8::/48").is_ok());
    }

    #[test]
    fn append_creates_opt_when_missing() {
        let q = test_query();
        let copy = append_ecs_if_absent(&q, &cn_subnet()).expect("should append");
        let edns = copy.extensions().as_ref().expect("opt added");
        assert_eq!(edns.max_payload(), EDNS_UDP_SIZE);
        assert_eq!(
            edns.option(EdnsCode::Subnet),
            Some(&EdnsOption::Subnet(cn_subnet()))
        );
        // the input query is untouched
        assert!(q.extensions().is_none());
    }

    #[test]
    fn append_extends_existing_opt() {
        let mut q = test_query();
        let mut edns = Edns::new();
        edns.set_max_payload(1232);
        *q.extensions_mut() = Some(edns);

        let copy = append_ecs_if_absent(&q, &cn_subnet()).expect("should append");
        let edns = copy.extensions().as_ref().expect("opt kept");
        // existing OPT is reused, its payload size is not rewritten
        assert_eq!(edns.max_payload(), 1232);
        assert!(edns.option(EdnsCode::Subnet).is_some());
    }

    #[test]
    fn append_is_idempotent() {
        let q = test_query();
        let once = append_ecs_if_absent(&q, &cn_subnet()).expect("first append");
        assert!(append_ecs_if_absent(&once, &cn_subnet()).is_none());
    }

    #[test]
    fn existing_client_ecs_is_preserved() {
        let q = test_query();
        let client_subnet = parse_subnet("9.9.9.0/24").expect("subnet");
        let with_client = append_ecs_if_absent(&q, &client_subnet).expect("append");
        assert!(append_ecs_if_absent(&with_client, &cn_subnet()).is_none());
        let edns = with_client.extensions().as_ref().expect("opt");
        assert_eq!(
            edns.option(EdnsCode::Subnet),
            Some(&EdnsOption::Subnet(client_subnet))
        );
    }

    #[test]
    fn input_wire_encoding_is_unchanged() {
        let q = test_query();
        let before = q.to_bytes().expect("encode");
        let _ = append_ecs_if_absent(&q, &cn_subnet());
        let after = q.to_bytes().expect("encode");
        assert_eq!(before, after);
    }
}
