use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use proptest::prelude::*;
use usm_common::batch::decode_page;
use usm_common::{BatchEvent, BatchPageHeader, ConnTuple, Http2StreamEvent};

fn ip_strategy() -> impl Strategy<Value = IpAddr> {
    prop_oneof![
        any::<[u8; 4]>().prop_map(|a| IpAddr::V4(Ipv4Addr::from(a))),
        any::<[u8; 16]>().prop_map(|a| IpAddr::V6(Ipv6Addr::from(a))),
    ]
}

fn tuple_strategy() -> impl Strategy<Value = ConnTuple> {
    (ip_strategy(), any::<u16>(), any::<u16>(), any::<bool>()).prop_map(
        |(addr, sport, dport, v6_peer)| {
            let peer = match (addr, v6_peer) {
                (IpAddr::V4(_), _) => IpAddr::V4(Ipv4Addr::new(192, 168, 0, 9)),
                (IpAddr::V6(_), true) => IpAddr::V6(Ipv6Addr::LOCALHOST),
                (IpAddr::V6(_), false) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            };
            ConnTuple::tcp(addr, sport, peer, dport)
        },
    )
}

// ---------------------------------------------------------------------------
// Property: both directions of a connection normalize to the same key
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn normalize_is_direction_independent(
        tuple in tuple_strategy(),
        ephemeral in prop_oneof![Just(32768u16), Just(1024u16), Just(u16::MAX)],
    ) {
        prop_assert_eq!(tuple.normalize(ephemeral), tuple.flip().normalize(ephemeral));
        let normalized = tuple.normalize(ephemeral);
        prop_assert!(normalized == tuple || normalized == tuple.flip());
    }

    #[test]
    fn tuple_addresses_survive_encoding(tuple in tuple_strategy()) {
        let mut buf = [0u8; ConnTuple::LEN];
        tuple.encode(&mut buf);
        let decoded = ConnTuple::decode(&buf).unwrap();
        prop_assert_eq!(decoded.source_addr(), tuple.source_addr());
        prop_assert_eq!(decoded.dest_addr(), tuple.dest_addr());
    }
}

// ---------------------------------------------------------------------------
// Property: decoding arbitrary bytes never panics
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn page_decoding_never_panics(
        data in proptest::collection::vec(any::<u8>(), 0..(BatchPageHeader::PAGE_LEN + 16)),
    ) {
        if let Ok((_, events)) = decode_page::<Http2StreamEvent>(&data) {
            for event in events {
                let _ = event;
            }
        }
        let _ = decode_page::<ConnTuple>(&data);
    }

    #[test]
    fn event_decoding_never_panics(
        data in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let _ = Http2StreamEvent::decode(&data);
    }
}

#[test]
fn page_holds_encoded_events_in_order() {
    let tuples: Vec<ConnTuple> = (0..5u16)
        .map(|i| {
            ConnTuple::tcp(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                40000 + i,
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                443,
            )
        })
        .collect();

    let header = BatchPageHeader {
        idx: 1,
        cpu: 0,
        len: tuples.len() as u16,
        cap: ConnTuple::BATCH_SIZE as u16,
        event_size: ConnTuple::EVENT_SIZE as u16,
        dropped_events: 0,
        failed_flushes: 0,
    };
    let mut page = vec![0u8; BatchPageHeader::PAGE_LEN];
    header.encode(&mut page);
    for (i, tuple) in tuples.iter().enumerate() {
        let start = BatchPageHeader::LEN + i * ConnTuple::EVENT_SIZE;
        tuple.encode(&mut page[start..]);
    }

    let (decoded_header, events) = decode_page::<ConnTuple>(&page).unwrap();
    assert_eq!(decoded_header, header);
    let decoded: Vec<ConnTuple> = events.map(Result::unwrap).collect();
    assert_eq!(decoded, tuples);
}
