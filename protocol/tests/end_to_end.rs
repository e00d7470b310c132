//! End-to-end scenarios (literal, spec §8) exercised through the public
//! `SessionManager` API only — no reaching into ratchet/X3DH internals.

use protocol::{Config, CoreError, IdentityStatus, KeyManager, MemoryStore, PreKeyBundle, SessionManager};

fn manager() -> SessionManager<MemoryStore> {
    let sm = SessionManager::new(MemoryStore::new(), Config::default());
    sm.key_manager().initialize(0).unwrap();
    sm
}

fn bundle_for(km: &KeyManager<MemoryStore>) -> PreKeyBundle {
    let identity = km.identity().unwrap();
    let spk = km.current_signed_pre_key().unwrap();
    let opks = km.generate_one_time_pre_keys(1).unwrap();
    PreKeyBundle {
        identity_public: identity.dh_public,
        identity_sign_public: identity.sign_public,
        spk_id: spk.id,
        spk_public: spk.public,
        spk_signature: spk.signature,
        opk_id: Some(opks[0].0),
        opk_public: Some(opks[0].1),
    }
}

fn bundle_without_opk(km: &KeyManager<MemoryStore>) -> PreKeyBundle {
    let identity = km.identity().unwrap();
    let spk = km.current_signed_pre_key().unwrap();
    PreKeyBundle {
        identity_public: identity.dh_public,
        identity_sign_public: identity.sign_public,
        spk_id: spk.id,
        spk_public: spk.public,
        spk_signature: spk.signature,
        opk_id: None,
        opk_public: None,
    }
}

#[test]
fn scenario_1_happy_path() {
    let bob = manager();
    let bob_bundle = bundle_for(bob.key_manager());

    let alice = manager();
    let frame1 = alice.encrypt("bob", b"Hello Bob! This is securely E2EE.", Some(&bob_bundle)).unwrap();
    assert_eq!(frame1[0], 1, "first frame must be wire type PreKey");
    let plaintext1 = bob.decrypt("alice", &frame1).unwrap();
    assert_eq!(plaintext1, b"Hello Bob! This is securely E2EE.");

    let frame2 = bob.encrypt("alice", b"Hey Alice, I got your encrypted message!", None).unwrap();
    assert_eq!(frame2[0], 2, "reply frame must be wire type Whisper");
    let plaintext2 = alice.decrypt("bob", &frame2).unwrap();
    assert_eq!(plaintext2, b"Hey Alice, I got your encrypted message!");

    let frame3 = alice.encrypt("bob", b"Perfect, the Double Ratchet works.", None).unwrap();
    assert_eq!(bob.decrypt("alice", &frame3).unwrap(), b"Perfect, the Double Ratchet works.");
}

#[test]
fn scenario_2_out_of_order_messages_cached_and_drained() {
    let bob = manager();
    let bob_bundle = bundle_for(bob.key_manager());

    let alice = manager();
    let m1 = alice.encrypt("bob", b"m1", Some(&bob_bundle)).unwrap();
    let m2 = alice.encrypt("bob", b"m2", None).unwrap();
    let m3 = alice.encrypt("bob", b"m3", None).unwrap();

    assert_eq!(bob.decrypt("alice", &m3).unwrap(), b"m3");
    assert_eq!(bob.skipped_count("alice").unwrap(), Some(2));

    assert_eq!(bob.decrypt("alice", &m1).unwrap(), b"m1");
    assert_eq!(bob.skipped_count("alice").unwrap(), Some(1));

    assert_eq!(bob.decrypt("alice", &m2).unwrap(), b"m2");
    assert_eq!(bob.skipped_count("alice").unwrap(), Some(0));
}

#[test]
fn scenario_3_large_gap_rejected_and_state_unchanged() {
    let bob = manager();
    let bob_bundle = bundle_for(bob.key_manager());

    let alice = manager();
    let first = alice.encrypt("bob", b"seed", Some(&bob_bundle)).unwrap();
    bob.decrypt("alice", &first).unwrap();

    // Bob has processed the seed (recv_n = 1). Alice now races ahead by
    // 1001 more messages without a reply, one further than `max_skip`
    // (1000) tolerates for a single decrypt call.
    let mut last = None;
    for i in 0..1002u32 {
        last = Some(alice.encrypt("bob", format!("msg-{i}").as_bytes(), None).unwrap());
    }
    let last = last.unwrap();

    let before = bob.skipped_count("alice").unwrap();
    let err = bob.decrypt("alice", &last).unwrap_err();
    assert_eq!(err, CoreError::TooManySkipped(1001));
    assert_eq!(bob.skipped_count("alice").unwrap(), before, "a rejected decrypt must not mutate ratchet state");
}

#[test]
fn scenario_4_tamper_then_subsequent_message_still_decrypts() {
    let bob = manager();
    let bob_bundle = bundle_for(bob.key_manager());

    let alice = manager();
    let first = alice.encrypt("bob", b"seed", Some(&bob_bundle)).unwrap();
    bob.decrypt("alice", &first).unwrap();

    let mut tampered = alice.encrypt("bob", b"a valid message", None).unwrap();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;
    assert_eq!(bob.decrypt("alice", &tampered).unwrap_err(), CoreError::AuthFailed);

    let next = alice.encrypt("bob", b"still works", None).unwrap();
    assert_eq!(bob.decrypt("alice", &next).unwrap(), b"still works");
}

#[test]
fn scenario_5_identity_change_then_fresh_x3dh() {
    let bob = manager();
    let bob_bundle = bundle_for(bob.key_manager());

    let alice = manager();
    let first = alice.encrypt("bob", b"hi bob", Some(&bob_bundle)).unwrap();
    bob.decrypt("alice", &first).unwrap();
    assert_eq!(
        alice.verify_remote_identity("bob", &bob_bundle.identity_public).unwrap(),
        IdentityStatus::Matches
    );

    // Bob reinstalls: fresh identity, fresh bundle.
    let bob_reinstalled = manager();
    let new_bundle = bundle_for(bob_reinstalled.key_manager());

    let status = alice.verify_remote_identity("bob", &new_bundle.identity_public).unwrap();
    assert_eq!(status, IdentityStatus::Changed);
    let safety_number = alice.safety_number("bob", &new_bundle.identity_public).unwrap();
    assert_eq!(safety_number.replace(' ', "").len(), 60);

    alice.delete_all_sessions("bob").unwrap();
    assert!(!alice.has_session("bob").unwrap());

    let resumed = alice.encrypt("bob", b"resuming after reinstall", Some(&new_bundle)).unwrap();
    assert_eq!(resumed[0], 1, "session re-established from scratch must be a PreKey frame");
    assert_eq!(
        bob_reinstalled.decrypt("alice", &resumed).unwrap(),
        b"resuming after reinstall"
    );
}

#[test]
fn scenario_6_opk_exhaustion_race_falls_back_to_no_opk() {
    let bob = manager();
    let bundle = bundle_for(bob.key_manager());

    // Two senders race on the same fetched bundle (simulating a directory
    // bug that hands out the same OPK twice).
    let alice = manager();
    let carol = manager();

    let alice_frame = alice.encrypt("bob", b"from alice", Some(&bundle)).unwrap();
    let carol_frame = carol.encrypt("bob", b"from carol", Some(&bundle)).unwrap();

    // Whichever arrives first consumes the OPK and succeeds.
    assert_eq!(bob.decrypt("alice", &alice_frame).unwrap(), b"from alice");

    // The second's inbound X3DH references an already-consumed OPK and no
    // session exists for "carol" yet, so it is reported as a duplicate.
    assert_eq!(bob.decrypt("carol", &carol_frame).unwrap_err(), CoreError::DuplicateMessage);

    // Carol's client discards the failed attempt's local session state and
    // falls back to a fresh X3DH without an OPK, which succeeds.
    carol.delete_all_sessions("bob").unwrap();
    let no_opk_bundle = bundle_without_opk(bob.key_manager());
    let retry = carol.encrypt("bob", b"retry without an otk", Some(&no_opk_bundle)).unwrap();
    assert_eq!(bob.decrypt("carol", &retry).unwrap(), b"retry without an otk");
}
