//! Property tests for connection string parsing.

use mysql_gateway::db::dsn::parse;
use proptest::prelude::*;

fn dsn() -> impl Strategy<Value = String> {
    (
        proptest::option::of("[a-z]{1,6}"),
        prop_oneof![Just(""), Just("+"), Just("-")],
        proptest::option::of("[a-z_]{1,8}"),
        proptest::option::of("[a-z0-9.]{1,8}"),
        proptest::option::of(any::<u16>()),
        proptest::collection::vec("[A-Za-z0-9_/]{1,8}", 0..4),
    )
        .prop_map(|(lock, mode, db, host, port, trailing)| {
            let mut tokens = Vec::new();
            if let Some(lock) = lock {
                tokens.push(format!("*{lock}"));
            }
            let mut positional = format!("{mode}{}", db.unwrap_or_default());
            if host.is_some() || port.is_some() {
                positional.push('@');
                positional.push_str(&host.unwrap_or_default());
                if let Some(port) = port {
                    positional.push_str(&format!(":{port}"));
                }
            }
            tokens.push(positional);
            tokens.extend(trailing);
            tokens.join(" ")
        })
}

proptest! {
    #[test]
    fn rendering_round_trips(s in dsn(), unicode in any::<bool>()) {
        let flags = parse(&s, unicode, None);
        let again = parse(&flags.to_string(), unicode, None);
        prop_assert_eq!(again, flags);
    }

    #[test]
    fn parsing_is_idempotent(s in dsn()) {
        prop_assert_eq!(parse(&s, false, None), parse(&s, false, None));
    }

    #[test]
    fn arbitrary_input_never_panics(s in ".{0,80}") {
        let _ = parse(&s, true, Some("latin1"));
    }

    #[test]
    fn generated_ports_survive(port in any::<u16>()) {
        let flags = parse(&format!("db@host:{port} user"), false, None);
        prop_assert_eq!(flags.params.port, Some(port));
        prop_assert_eq!(flags.params.user.as_deref(), Some("user"));
    }
}
