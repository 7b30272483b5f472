//! Property tests for the frame codec and backoff policy.

use std::time::{Duration, Instant};

use kilovault_bms::{codec, DecodeError, PollScheduler, SchedulerConfig, StatusMessage};
use proptest::prelude::*;

const FRAME_LEN: usize = 121;

fn status_message() -> impl Strategy<Value = StatusMessage> {
    (
        (any::<u16>(), any::<i32>(), any::<u32>(), any::<u16>(), 0u16..=100),
        (any::<u16>(), any::<u16>(), any::<u16>(), any::<[u16; 4]>()),
    )
        .prop_map(
            |(
                (voltage_mv, current_ma, total_capacity_mah, cycles, state_of_charge_pct),
                (temperature_dk, status, afe_status, cell_voltage_mv),
            )| StatusMessage {
                voltage_mv,
                current_ma,
                total_capacity_mah,
                cycles,
                state_of_charge_pct,
                temperature_dk,
                status,
                afe_status,
                cell_voltage_mv,
            },
        )
}

proptest! {
    #[test]
    fn decode_inverts_encode(message in status_message()) {
        let now = Instant::now();
        let frame = codec::encode_status(&message);
        prop_assert_eq!(frame.len(), FRAME_LEN);
        prop_assert_eq!(codec::decode_at(&frame, now), Ok(message.into_record(now)));
    }

    #[test]
    fn short_input_is_too_short(bytes in proptest::collection::vec(any::<u8>(), 0..FRAME_LEN)) {
        let len = bytes.len();
        prop_assert_eq!(
            codec::decode(&bytes),
            Err(DecodeError::TooShort { len, expected: FRAME_LEN })
        );
    }

    #[test]
    fn arbitrary_input_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..400)) {
        let _ = codec::decode(&bytes);
    }

    #[test]
    fn single_bit_flip_fails_the_checksum(
        message in status_message(),
        byte in 0usize..56,
        bit in 0u8..8,
    ) {
        let frame = codec::encode_status(&message);
        let mut payload = hex::decode(&frame[1..]).unwrap();
        payload[byte] ^= 1 << bit;
        let mut flipped = vec![frame[0]];
        flipped.extend_from_slice(hex::encode_upper(&payload).as_bytes());

        let result = codec::decode(&flipped);
        prop_assert!(
            matches!(result, Err(DecodeError::BadChecksum { .. })),
            "expected BadChecksum, got {:?}",
            result
        );
    }

    #[test]
    fn backoff_is_monotonic_and_capped(base_ms in 1u64..60_000, factor in 1u32..10) {
        let base = Duration::from_millis(base_ms);
        let cap = base * factor;
        let scheduler = PollScheduler::new(SchedulerConfig {
            backoff_base: base,
            backoff_cap: cap,
            ..SchedulerConfig::default()
        });

        let delays: Vec<Duration> = (1..40).map(|n| scheduler.backoff_delay(n)).collect();
        prop_assert_eq!(delays[0], base);
        prop_assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        prop_assert!(delays.iter().all(|&d| d <= cap));
        prop_assert_eq!(*delays.last().unwrap(), cap);
    }
}
