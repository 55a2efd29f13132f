//! Codec properties
//!
//! Round-trip and partial-frame behaviour of the framed codec, verified
//! over generated messages: encoding then decoding any valid message or
//! acknowledgement yields the original, an encoded frame is exactly
//! `16 + body_length` bytes, and decoding over arbitrary byte-boundary
//! splits gives the same result as decoding the whole frame.

use std::sync::Arc;

use bytes::BytesMut;
use proptest::prelude::*;

use registry_rs::protocol::codec::{Decoder, Encoder, Inbound};
use registry_rs::protocol::constants::HEADER_LENGTH;
use registry_rs::protocol::message::{Acknowledge, Message, Payload, Sign};
use registry_rs::registry::meta::{Address, RegisterMeta, ServiceMeta};
use registry_rs::serializer::{BincodeSerializer, Serializer};

fn serializer() -> Arc<dyn Serializer> {
    Arc::new(BincodeSerializer::new())
}

fn service_meta() -> impl Strategy<Value = ServiceMeta> {
    ("[a-z]{1,8}", "[a-z]{1,12}", "[0-9]\\.[0-9]\\.[0-9]")
        .prop_map(|(group, name, version)| ServiceMeta::new(group, name, version))
}

fn address() -> impl Strategy<Value = Address> {
    ("[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}", any::<u16>())
        .prop_map(|(host, port)| Address::new(host, port))
}

fn register_meta() -> impl Strategy<Value = RegisterMeta> {
    (service_meta(), address(), 0..=100u32, 1..=64u32).prop_map(
        |(service, address, weight, conn_count)| {
            let mut meta = RegisterMeta::new(service, address);
            meta.weight = weight;
            meta.conn_count = conn_count;
            meta
        },
    )
}

fn payload() -> impl Strategy<Value = Payload> {
    prop_oneof![
        register_meta().prop_map(Payload::Register),
        service_meta().prop_map(Payload::Subscribe),
        (service_meta(), prop::collection::vec(register_meta(), 0..4))
            .prop_map(|(service, list)| Payload::Providers { service, list }),
    ]
}

/// Any message the decoder can emit (heartbeat and ack signs carry other
/// body types and are exercised separately).
fn message() -> impl Strategy<Value = Message> {
    (
        prop_oneof![
            Just(Sign::Publish),
            Just(Sign::Unpublish),
            Just(Sign::Subscribe)
        ],
        any::<u64>(),
        any::<i64>(),
        payload(),
    )
        .prop_map(|(sign, sequence, version, data)| Message {
            sign,
            sequence,
            version,
            data,
        })
}

proptest! {
    #[test]
    fn prop_message_round_trip(msg in message()) {
        let encoder = Encoder::new(serializer());
        let mut decoder = Decoder::new(serializer());

        let body_len = serializer().write_message(&msg).unwrap().len();
        let frame = encoder.encode_message(&msg).unwrap();
        prop_assert_eq!(frame.len(), HEADER_LENGTH + body_len);

        let mut buf = BytesMut::from(&frame[..]);
        let decoded = decoder.decode(&mut buf).unwrap();
        prop_assert_eq!(decoded, Some(Inbound::Message(msg)));
        prop_assert!(buf.is_empty());
    }

    #[test]
    fn prop_ack_round_trip(sequence in any::<u64>()) {
        let encoder = Encoder::new(serializer());
        let mut decoder = Decoder::new(serializer());
        let ack = Acknowledge::new(sequence);

        let body_len = serializer().write_ack(&ack).unwrap().len();
        let frame = encoder.encode_ack(&ack).unwrap();
        prop_assert_eq!(frame.len(), HEADER_LENGTH + body_len);

        let mut buf = BytesMut::from(&frame[..]);
        prop_assert_eq!(decoder.decode(&mut buf).unwrap(), Some(Inbound::Ack(ack)));
    }

    /// Decoding over arbitrary splits of a frame stream equals decoding it
    /// whole, regardless of where the chunk boundaries fall.
    #[test]
    fn prop_split_decoding_matches_whole(
        msgs in prop::collection::vec(message(), 1..4),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..6),
    ) {
        let encoder = Encoder::new(serializer());

        let mut stream = Vec::new();
        for msg in &msgs {
            stream.extend_from_slice(&encoder.encode_message(msg).unwrap());
        }

        // Whole-stream reference decode.
        let mut reference = Vec::new();
        {
            let mut decoder = Decoder::new(serializer());
            let mut buf = BytesMut::from(&stream[..]);
            while let Some(inbound) = decoder.decode(&mut buf).unwrap() {
                reference.push(inbound);
            }
        }

        // Chunked decode over the generated boundaries.
        let mut offsets: Vec<usize> = cuts.iter().map(|ix| ix.index(stream.len())).collect();
        offsets.push(0);
        offsets.push(stream.len());
        offsets.sort_unstable();
        offsets.dedup();

        let mut decoder = Decoder::new(serializer());
        let mut buf = BytesMut::new();
        let mut chunked = Vec::new();
        for window in offsets.windows(2) {
            buf.extend_from_slice(&stream[window[0]..window[1]]);
            while let Some(inbound) = decoder.decode(&mut buf).unwrap() {
                chunked.push(inbound);
            }
        }

        prop_assert_eq!(chunked, reference);
        prop_assert!(buf.is_empty());
    }
}
