//! Integration tests for the immutable network state model: lookup index
//! consistency, mirrored membership edges, and structural sharing.

use slirc_client::{CaseMapping, NetworkState};

fn base() -> NetworkState {
    NetworkState::new("testnet", "me")
}

#[test]
fn test_index_consistent_after_update_sequences() {
    let state = base();
    let (state, alice) = state.with_user_added("Alice").unwrap();
    let (state, bob) = state.with_user_added("bob[away]").unwrap();
    let (state, rust) = state.with_channel_added("#Rust").unwrap();
    let (state, dev) = state.with_channel_added("#dev").unwrap();

    let state = state
        .with_membership(alice, rust, "@").unwrap()
        .with_membership(alice, dev, "").unwrap()
        .with_membership(bob, rust, "+").unwrap()
        .with_user_updated(alice, |u| u.nick = "alicia".to_string()).unwrap()
        .with_channel_updated(dev, |c| c.name = "#dev-null".to_string()).unwrap();

    state.check_consistency().unwrap();

    // Folded lookups reverse-resolve to records whose names fold to the
    // same key.
    for nick in ["ALICIA", "alicia", "BOB[AWAY]"] {
        let user = state.user_by_nick(nick).expect(nick);
        assert!(state
            .case_mapping()
            .irc_eq(&user.nick, nick));
    }
    assert!(state.user_by_nick("alice").is_none());
    assert!(state.channel("#DEV-NULL").is_some());
    assert!(state.channel("#dev").is_none());
}

#[test]
fn test_membership_edges_always_mirrored() {
    let state = base();
    let (state, a) = state.with_user_added("a").unwrap();
    let (state, b) = state.with_user_added("b").unwrap();
    let (state, c1) = state.with_channel_added("#one").unwrap();
    let (state, c2) = state.with_channel_added("#two").unwrap();

    let state = state
        .with_membership(a, c1, "").unwrap()
        .with_membership(a, c2, "@").unwrap()
        .with_membership(b, c1, "+").unwrap()
        .without_membership(a, c1).unwrap()
        .with_channel_removed(c2).unwrap()
        .with_lost_users_pruned();

    state.check_consistency().unwrap();

    // For every user, the channel keyset equals the channels whose user
    // sets contain that user.
    for user in state.all_users() {
        for chan in state.all_channels() {
            assert_eq!(
                user.channels.contains_key(&chan.id),
                chan.users.contains_key(&user.id),
                "edge mismatch between {} and {}",
                user.nick,
                chan.name
            );
        }
    }
    // `a` lost all channels and was pruned; `b` remains in #one.
    assert!(state.user_by_nick("a").is_none());
    assert_eq!(state.users_in_channel("#one").len(), 1);
}

#[test]
fn test_casemapping_switch_scenario() {
    // Under ascii, Foo and foo would collide only case-insensitively on
    // ASCII letters; the rfc1459 extras do not fold yet.
    let state = base();
    let (state, _) = state.with_user_added("nick[one]").unwrap();
    assert!(state.user_by_nick("nick{one}").is_none());

    let state = state.with_case_mapping(CaseMapping::Rfc1459);
    assert!(state.user_by_nick("nick{one}").is_some());
    state.check_consistency().unwrap();

    // Inserting a name that now folds onto an existing key is rejected.
    assert!(state.with_user_added("NICK{ONE}").is_err());
}

#[test]
fn test_unsafe_update_then_restore_is_identity() {
    let state = base();
    let (state, alice) = state.with_user_added("alice").unwrap();
    let original = (**state.user_by_nick("alice").unwrap()).clone();

    let modified = state
        .with_user_updated(alice, |u| {
            u.away = true;
            u.realname = "Someone".into();
        })
        .unwrap();
    let restored = modified
        .with_user_updated(alice, |u| *u = original.clone())
        .unwrap();

    assert_eq!(
        state.user_by_nick("alice"),
        restored.user_by_nick("alice")
    );
    restored.check_consistency().unwrap();
}

#[test]
fn test_snapshots_are_isolated() {
    let s0 = base();
    let (s1, alice) = s0.with_user_added("alice").unwrap();
    let (s2, chan) = s1.with_channel_added("#c").unwrap();
    let s3 = s2.with_membership(alice, chan, "@").unwrap();

    assert!(s0.user_by_nick("alice").is_none());
    assert!(s1.channel("#c").is_none());
    assert!(s2.channel("#c").unwrap().users.is_empty());
    assert_eq!(s3.channel("#c").unwrap().users.len(), 1);
}

#[test]
fn test_isupport_defaults_and_views() {
    let state = base();
    assert_eq!(state.isupport_or_default("CHANTYPES", "#&"), "#&");
    assert_eq!(state.isupport("NETWORK"), None);

    let state = state
        .with_isupport_token("NETWORK=TestNet")
        .with_isupport_token("PREFIX=(qov)~@+")
        .with_isupport_token("EXCEPTS");
    assert_eq!(state.isupport("NETWORK"), Some(Some("TestNet")));
    assert_eq!(state.isupport("EXCEPTS"), Some(None));
    let prefix = state.isupport_map().prefix();
    assert_eq!(prefix.modes(), "qov");
    assert_eq!(prefix.symbols(), "~@+");
}

#[test]
fn test_linelen_keeps_larger_value() {
    let state = base().with_isupport_token("LINELEN=2048");
    assert_eq!(state.limits().line_length, 2048);
    // A later, smaller advertisement does not shrink the limit.
    let state = state.with_isupport_token("LINELEN=1024");
    assert_eq!(state.limits().line_length, 2048);
}
