// Property-based tests for cron trigger computation

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use common::trigger;
use proptest::prelude::*;

fn arb_after() -> impl Strategy<Value = DateTime<Utc>> {
    // Timestamps between 2020 and 2030.
    (1_577_836_800i64..1_893_456_000i64).prop_map(|secs| Utc.timestamp_opt(secs, 0).unwrap())
}

fn arb_expression() -> impl Strategy<Value = String> {
    (0u8..60, 0u8..24, 1u8..29).prop_map(|(minute, hour, day)| {
        format!("{} {} {} * *", minute, hour, day)
    })
}

proptest! {
    #[test]
    fn next_fire_time_is_strictly_after_the_reference(
        expression in arb_expression(),
        after in arb_after(),
    ) {
        let next = trigger::next_fire_time(&expression, Tz::UTC, after).unwrap();
        prop_assert!(next > after);
    }

    #[test]
    fn next_fire_time_is_the_earliest_candidate(
        expression in arb_expression(),
        after in arb_after(),
    ) {
        // Nothing between `after` and the reported fire time may match:
        // asking again from one second before the fire time returns it again.
        let next = trigger::next_fire_time(&expression, Tz::UTC, after).unwrap();
        let just_before = next - chrono::Duration::seconds(1);
        let again = trigger::next_fire_time(&expression, Tz::UTC, just_before).unwrap();
        prop_assert_eq!(next, again);
    }

    #[test]
    fn next_fire_time_is_monotone_in_the_reference(
        expression in arb_expression(),
        after in arb_after(),
        advance in 0i64..86_400 * 40,
    ) {
        let earlier = trigger::next_fire_time(&expression, Tz::UTC, after).unwrap();
        let later_ref = after + chrono::Duration::seconds(advance);
        let later = trigger::next_fire_time(&expression, Tz::UTC, later_ref).unwrap();
        prop_assert!(later >= earlier);
    }

    #[test]
    fn next_n_is_strictly_increasing(
        expression in arb_expression(),
        after in arb_after(),
        n in 1usize..8,
    ) {
        let fires = trigger::next_n(&expression, Tz::UTC, n, after).unwrap();
        prop_assert_eq!(fires.len(), n);
        for window in fires.windows(2) {
            prop_assert!(window[0] < window[1]);
        }
        prop_assert!(fires[0] > after);
    }

    #[test]
    fn five_field_expressions_mean_second_zero(
        expression in arb_expression(),
        after in arb_after(),
    ) {
        let six_field = format!("0 {}", expression);
        let from_five = trigger::next_fire_time(&expression, Tz::UTC, after).unwrap();
        let from_six = trigger::next_fire_time(&six_field, Tz::UTC, after).unwrap();
        prop_assert_eq!(from_five, from_six);
    }

    #[test]
    fn validation_agrees_with_fire_time_computation(expression in arb_expression()) {
        prop_assert!(trigger::validate(&expression));
    }

    #[test]
    fn timezone_offset_shifts_the_utc_fire_time(after in arb_after()) {
        // A fixed wall-clock schedule in a non-UTC zone lands on a
        // different UTC instant than the same schedule in UTC.
        let shanghai: Tz = "Asia/Shanghai".parse().unwrap();
        let in_utc = trigger::next_fire_time("30 2 * * *", Tz::UTC, after).unwrap();
        let in_shanghai = trigger::next_fire_time("30 2 * * *", shanghai, after).unwrap();
        prop_assert_ne!(in_utc, in_shanghai);
    }
}
