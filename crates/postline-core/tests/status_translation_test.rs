//! Property tests for provider status translation.

use postline_core::{MailStatus, StatusTranslator};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};

const KNOWN: &[(&str, MailStatus)] = &[
    ("delivered", MailStatus::Delivered),
    ("returned", MailStatus::Returned),
    ("returned_to_sender", MailStatus::Returned),
    ("re-routed", MailStatus::InTransit),
    ("in_transit", MailStatus::InTransit),
    ("processed_for_delivery", MailStatus::InLocalArea),
    ("in_local_area", MailStatus::InLocalArea),
    ("processing", MailStatus::Submitted),
    ("printed", MailStatus::Submitted),
    ("mailed", MailStatus::Submitted),
    ("created", MailStatus::Submitted),
    ("cancelled", MailStatus::Failed),
    ("failed", MailStatus::Failed),
];

fn proptest_config() -> ProptestConfig {
    ProptestConfig { cases: 256, failure_persistence: None, ..ProptestConfig::default() }
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn arbitrary_input_never_panics(input in ".*") {
        let _ = StatusTranslator::map(&input);
    }

    #[test]
    fn unrecognised_lowercase_words_are_unknown(input in "[a-z_]{1,24}") {
        prop_assume!(KNOWN.iter().all(|(known, _)| *known != input));
        prop_assert_eq!(StatusTranslator::map(&input), MailStatus::Unknown);
    }

    #[test]
    fn known_statuses_survive_padding_and_case(
        index in 0..KNOWN.len(),
        left in " {0,3}",
        right in "[ \t]{0,3}",
        upper in any::<bool>(),
    ) {
        let (status, expected) = KNOWN[index];
        let cased = if upper { status.to_ascii_uppercase() } else { status.to_string() };
        let input = format!("{left}{cased}{right}");
        prop_assert_eq!(StatusTranslator::map(&input), expected);
    }

    #[test]
    fn translation_output_parses_back(input in ".*") {
        let status = StatusTranslator::map(&input);
        prop_assert_eq!(status.as_str().parse::<MailStatus>().unwrap(), status);
    }
}

#[test]
fn delivered_translates_to_delivered() {
    assert_eq!(StatusTranslator::map("delivered"), MailStatus::Delivered);
}

#[test]
fn unknown_vocabulary_translates_to_unknown() {
    assert_eq!(StatusTranslator::map("totally_new_status"), MailStatus::Unknown);
}
