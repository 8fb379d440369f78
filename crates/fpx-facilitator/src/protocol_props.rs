use proptest::prelude::*;
use crate::protocol::Transaction;

proptest! {
    // Arbitrary values, including quotes, backslashes and spaces, survive being
    // rendered and parsed back.
    #[test]
    fn test_quoted_values_survive(
        command in "[A-Z]{1,8}",
        params in prop::collection::vec(("[A-Z][A-Z-]{0,12}", "[ -~]{0,40}"), 0..6),
    ) {
        let mut tx = Transaction::new(command);
        for (key, value) in params {
            tx = tx.with_param(key, value);
        }

        let parsed = Transaction::parse(&tx.to_string());
        prop_assert_eq!(parsed, Ok(tx));
    }

    // Garbage lines are rejected or accepted, never panic.
    #[test]
    fn test_parse_total(line in "\\PC{0,200}") {
        let _ = Transaction::parse(&line);
    }
}
