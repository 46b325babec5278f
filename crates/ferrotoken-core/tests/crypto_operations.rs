use cryptoki_sys::*;
use ferrotoken_core::{
    AttributeTemplate, AttributeValue, Engine, EngineConfig, Handle, Mechanism, MechanismParams,
    Output, TokenError,
};

const USER_PIN: &[u8] = b"user-1234";

fn logged_in_engine() -> (Engine, Handle) {
    let engine = Engine::new(EngineConfig {
        pin_iterations: 10,
        ..EngineConfig::default()
    })
    .expect("engine");
    engine.init_token(0, b"so-secret", "ops").expect("init token");
    let session = engine
        .open_session(0, CKF_SERIAL_SESSION | CKF_RW_SESSION)
        .expect("session");
    engine.login(session, CKU_SO, b"so-secret").expect("so login");
    engine.init_pin(session, USER_PIN).expect("init pin");
    engine.logout(session).expect("logout");
    engine.login(session, CKU_USER, USER_PIN).expect("user login");
    (engine, session)
}

fn aes_key(engine: &Engine, session: Handle) -> Handle {
    let template = AttributeTemplate::new()
        .with(CKA_CLASS, AttributeValue::Ulong(CKO_SECRET_KEY))
        .with(CKA_KEY_TYPE, AttributeValue::Ulong(CKK_AES))
        .with(CKA_VALUE_LEN, AttributeValue::Ulong(16))
        .with(CKA_ENCRYPT, AttributeValue::Bool(true))
        .with(CKA_DECRYPT, AttributeValue::Bool(true));
    engine
        .generate_key(session, &Mechanism::new(CKM_AES_KEY_GEN), &template)
        .expect("aes key")
}

fn cbc_pad() -> Mechanism {
    Mechanism::with_params(CKM_AES_CBC_PAD, MechanismParams::Iv(vec![0x24; 16]))
}

fn data(output: Output) -> Vec<u8> {
    output.into_data().expect("output data")
}

#[test]
fn cbc_pad_update_then_final_pads_to_block_multiple() {
    let (engine, session) = logged_in_engine();
    let key = aes_key(&engine, session);
    let plaintext = vec![0x42u8; 37];

    engine.encrypt_init(session, &cbc_pad(), key).expect("init");
    let mut ciphertext = data(engine.encrypt_update(session, &plaintext, Some(64)).expect("update"));
    assert_eq!(ciphertext.len(), 32);
    assert_eq!(engine.encrypt_final(session, None), Ok(Output::Required(16)));
    ciphertext.extend(data(engine.encrypt_final(session, Some(16)).expect("final")));
    assert_eq!(ciphertext.len(), (37 / 16 + 1) * 16);

    engine.decrypt_init(session, &cbc_pad(), key).expect("init");
    let recovered = data(engine.decrypt(session, &ciphertext, Some(48)).expect("decrypt"));
    assert_eq!(recovered, plaintext);
}

#[test]
fn size_query_keeps_operation_alive() {
    let (engine, session) = logged_in_engine();
    let key = aes_key(&engine, session);
    engine.encrypt_init(session, &cbc_pad(), key).expect("init");
    assert_eq!(engine.encrypt(session, b"query", None), Ok(Output::Required(16)));
    assert_eq!(engine.encrypt(session, b"query", Some(4)), Ok(Output::Required(16)));
    let sealed = data(engine.encrypt(session, b"query", Some(16)).expect("encrypt"));
    assert_eq!(sealed.len(), 16);
    assert_eq!(
        engine.encrypt_final(session, Some(16)),
        Err(TokenError::OperationNotInitialized)
    );
}

#[test]
fn single_part_after_update_is_rejected_and_terminates() {
    let (engine, session) = logged_in_engine();
    let key = aes_key(&engine, session);
    engine.encrypt_init(session, &cbc_pad(), key).expect("init");
    engine
        .encrypt_update(session, &[1u8; 20], Some(32))
        .expect("update");
    assert_eq!(
        engine.encrypt(session, b"more", Some(64)),
        Err(TokenError::OperationActive)
    );
    assert_eq!(
        engine.encrypt_update(session, b"more", Some(64)),
        Err(TokenError::OperationNotInitialized)
    );
}

#[test]
fn second_init_reports_operation_active() {
    let (engine, session) = logged_in_engine();
    let key = aes_key(&engine, session);
    engine.encrypt_init(session, &cbc_pad(), key).expect("init");
    assert_eq!(
        engine.encrypt_init(session, &cbc_pad(), key),
        Err(TokenError::OperationActive)
    );
    // An independent category is unaffected.
    engine.decrypt_init(session, &cbc_pad(), key).expect("decrypt init");
}

#[test]
fn destroying_key_invalidates_in_flight_operation() {
    let (engine, session) = logged_in_engine();
    let key = aes_key(&engine, session);
    engine.encrypt_init(session, &cbc_pad(), key).expect("init");
    engine.destroy_object(session, key).expect("destroy");
    assert_eq!(
        engine.encrypt_update(session, &[0u8; 16], Some(16)),
        Err(TokenError::KeyHandleInvalid)
    );
    assert_eq!(
        engine.encrypt_init(session, &cbc_pad(), key),
        Err(TokenError::KeyHandleInvalid)
    );
    assert_eq!(
        engine.object_size(session, key),
        Err(TokenError::ObjectHandleInvalid)
    );
}

#[test]
fn key_without_usage_flag_is_refused_at_init() {
    let (engine, session) = logged_in_engine();
    let template = AttributeTemplate::new()
        .with(CKA_VALUE_LEN, AttributeValue::Ulong(32))
        .with(CKA_ENCRYPT, AttributeValue::Bool(true))
        .with(CKA_DECRYPT, AttributeValue::Bool(false));
    let key = engine
        .generate_key(session, &Mechanism::new(CKM_AES_KEY_GEN), &template)
        .expect("key");
    assert_eq!(
        engine.decrypt_init(session, &cbc_pad(), key),
        Err(TokenError::KeyFunctionNotPermitted)
    );
    assert_eq!(
        engine.encrypt_init(
            session,
            &Mechanism::with_params(CKM_AES_CBC, MechanismParams::Iv(vec![0; 8])),
            key
        ),
        Err(TokenError::MechanismParamInvalid(
            "CBC requires a 16 byte IV".to_string()
        ))
    );
}

#[test]
fn gcm_round_trip_and_tamper_detection() {
    let (engine, session) = logged_in_engine();
    let key = aes_key(&engine, session);
    let mechanism = Mechanism::with_params(
        CKM_AES_GCM,
        MechanismParams::Gcm {
            iv: vec![9; 12],
            aad: b"context".to_vec(),
            tag_bits: 128,
        },
    );
    engine.encrypt_init(session, &mechanism, key).expect("init");
    assert!(data(engine.encrypt_update(session, b"hello ", Some(0)).expect("update")).is_empty());
    assert!(data(engine.encrypt_update(session, b"world", Some(0)).expect("update")).is_empty());
    let mut sealed = data(engine.encrypt_final(session, Some(64)).expect("final"));
    assert_eq!(sealed.len(), 11 + 16);

    engine.decrypt_init(session, &mechanism, key).expect("init");
    assert_eq!(
        data(engine.decrypt(session, &sealed, Some(64)).expect("decrypt")),
        b"hello world".to_vec()
    );

    sealed[0] ^= 1;
    engine.decrypt_init(session, &mechanism, key).expect("init");
    assert_eq!(
        engine.decrypt(session, &sealed, Some(64)),
        Err(TokenError::EncryptedDataInvalid)
    );
}

#[test]
fn digest_matches_known_answer_across_parts() {
    let (engine, session) = logged_in_engine();
    let expected =
        hex::decode("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad").expect("hex");

    engine
        .digest_init(session, &Mechanism::new(CKM_SHA256))
        .expect("init");
    assert_eq!(data(engine.digest(session, b"abc", Some(32)).expect("digest")), expected);

    engine
        .digest_init(session, &Mechanism::new(CKM_SHA256))
        .expect("init");
    engine.digest_update(session, b"a").expect("update");
    engine.digest_update(session, b"bc").expect("update");
    assert_eq!(engine.digest_final(session, Some(8)), Ok(Output::Required(32)));
    assert_eq!(data(engine.digest_final(session, Some(32)).expect("final")), expected);
}

#[test]
fn hmac_sign_and_verify_multipart() {
    let (engine, session) = logged_in_engine();
    let template = AttributeTemplate::new()
        .with(CKA_VALUE_LEN, AttributeValue::Ulong(32))
        .with(CKA_SIGN, AttributeValue::Bool(true))
        .with(CKA_VERIFY, AttributeValue::Bool(true));
    let key = engine
        .generate_key(session, &Mechanism::new(CKM_GENERIC_SECRET_KEY_GEN), &template)
        .expect("key");
    let mechanism = Mechanism::new(CKM_SHA256_HMAC);

    engine.sign_init(session, &mechanism, key).expect("init");
    engine.sign_update(session, b"part one, ").expect("update");
    engine.sign_update(session, b"part two").expect("update");
    let tag = data(engine.sign_final(session, Some(32)).expect("final"));
    assert_eq!(tag.len(), 32);

    engine.verify_init(session, &mechanism, key).expect("init");
    engine
        .verify(session, b"part one, part two", &tag)
        .expect("valid tag");

    engine.verify_init(session, &mechanism, key).expect("init");
    assert_eq!(
        engine.verify(session, b"part one, part 2", &tag),
        Err(TokenError::SignatureInvalid)
    );
    engine.verify_init(session, &mechanism, key).expect("init");
    assert_eq!(
        engine.verify(session, b"part one, part two", &tag[..16]),
        Err(TokenError::SignatureLenRange)
    );
}

#[test]
fn ecdsa_and_eddsa_signatures_verify() {
    let (engine, session) = logged_in_engine();
    let p256 = [0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07];
    let public = AttributeTemplate::new()
        .with(CKA_EC_PARAMS, AttributeValue::Bytes(p256.to_vec()))
        .with(CKA_VERIFY, AttributeValue::Bool(true));
    let private = AttributeTemplate::new().with(CKA_SIGN, AttributeValue::Bool(true));
    let (public_key, private_key) = engine
        .generate_key_pair(session, &Mechanism::new(CKM_EC_KEY_PAIR_GEN), &public, &private)
        .expect("ec pair");

    let mechanism = Mechanism::new(CKM_ECDSA_SHA256);
    engine.sign_init(session, &mechanism, private_key).expect("init");
    let signature = data(engine.sign(session, b"message", Some(64)).expect("sign"));
    assert_eq!(signature.len(), 64);
    engine.verify_init(session, &mechanism, public_key).expect("init");
    engine.verify_update(session, b"mess").expect("update");
    engine.verify_update(session, b"age").expect("update");
    engine.verify_final(session, &signature).expect("valid");

    let public = AttributeTemplate::new().with(CKA_VERIFY, AttributeValue::Bool(true));
    let (public_key, private_key) = engine
        .generate_key_pair(
            session,
            &Mechanism::new(CKM_EC_EDWARDS_KEY_PAIR_GEN),
            &public,
            &private,
        )
        .expect("ed pair");
    let mechanism = Mechanism::new(CKM_EDDSA);
    engine.sign_init(session, &mechanism, private_key).expect("init");
    assert_eq!(
        engine.sign_update(session, b"not multipart"),
        Err(TokenError::FunctionNotSupported)
    );
    engine.sign_init(session, &mechanism, private_key).expect("init");
    let signature = data(engine.sign(session, b"message", Some(64)).expect("sign"));
    engine.verify_init(session, &mechanism, public_key).expect("init");
    engine.verify(session, b"message", &signature).expect("valid");
}

#[test]
fn rsa_sign_recover_round_trip() {
    let (engine, session) = logged_in_engine();
    let public = AttributeTemplate::new()
        .with(CKA_MODULUS_BITS, AttributeValue::Ulong(1024))
        .with(CKA_VERIFY_RECOVER, AttributeValue::Bool(true))
        .with(CKA_ENCRYPT, AttributeValue::Bool(true));
    let private = AttributeTemplate::new()
        .with(CKA_SIGN_RECOVER, AttributeValue::Bool(true))
        .with(CKA_DECRYPT, AttributeValue::Bool(true));
    let (public_key, private_key) = engine
        .generate_key_pair(
            session,
            &Mechanism::new(CKM_RSA_PKCS_KEY_PAIR_GEN),
            &public,
            &private,
        )
        .expect("rsa pair");
    let mechanism = Mechanism::new(CKM_RSA_PKCS);

    engine
        .sign_recover_init(session, &mechanism, private_key)
        .expect("init");
    let signature = data(engine.sign_recover(session, b"recoverable", Some(128)).expect("sign"));
    engine
        .verify_recover_init(session, &mechanism, public_key)
        .expect("init");
    assert_eq!(engine.verify_recover(session, &signature, None), Ok(Output::Required(128)));
    assert_eq!(
        data(engine.verify_recover(session, &signature, Some(128)).expect("recover")),
        b"recoverable".to_vec()
    );

    engine.encrypt_init(session, &mechanism, public_key).expect("init");
    let ciphertext = data(engine.encrypt(session, b"secret", Some(128)).expect("encrypt"));
    engine.decrypt_init(session, &mechanism, private_key).expect("init");
    assert_eq!(
        data(engine.decrypt(session, &ciphertext, Some(128)).expect("decrypt")),
        b"secret".to_vec()
    );
}

#[test]
fn plain_verify_leaves_verify_recover_context_alone() {
    let (engine, session) = logged_in_engine();
    let public = AttributeTemplate::new()
        .with(CKA_MODULUS_BITS, AttributeValue::Ulong(1024))
        .with(CKA_VERIFY_RECOVER, AttributeValue::Bool(true));
    let private = AttributeTemplate::new().with(CKA_SIGN_RECOVER, AttributeValue::Bool(true));
    let (public_key, private_key) = engine
        .generate_key_pair(
            session,
            &Mechanism::new(CKM_RSA_PKCS_KEY_PAIR_GEN),
            &public,
            &private,
        )
        .expect("rsa pair");
    let mechanism = Mechanism::new(CKM_RSA_PKCS);
    engine
        .sign_recover_init(session, &mechanism, private_key)
        .expect("init");
    let signature = data(engine.sign_recover(session, b"kept", Some(128)).expect("sign"));

    engine
        .verify_recover_init(session, &mechanism, public_key)
        .expect("init");
    assert_eq!(
        engine.verify(session, b"kept", &signature),
        Err(TokenError::OperationNotInitialized)
    );
    assert_eq!(
        engine.verify_final(session, &signature),
        Err(TokenError::OperationNotInitialized)
    );
    assert_eq!(
        data(engine.verify_recover(session, &signature, Some(128)).expect("recover")),
        b"kept".to_vec()
    );
}

#[test]
fn digest_encrypt_feeds_both_operations() {
    let (engine, session) = logged_in_engine();
    let key = aes_key(&engine, session);
    let plaintext = [7u8; 40];

    engine
        .digest_init(session, &Mechanism::new(CKM_SHA256))
        .expect("digest init");
    engine.encrypt_init(session, &cbc_pad(), key).expect("encrypt init");
    assert_eq!(
        engine.digest_encrypt_update(session, &plaintext, None),
        Ok(Output::Required(32))
    );
    let mut ciphertext = data(
        engine
            .digest_encrypt_update(session, &plaintext, Some(48))
            .expect("update"),
    );
    ciphertext.extend(data(engine.encrypt_final(session, Some(16)).expect("final")));
    let digest = data(engine.digest_final(session, Some(32)).expect("digest"));
    assert_eq!(ciphertext.len(), 48);

    engine
        .digest_init(session, &Mechanism::new(CKM_SHA256))
        .expect("init");
    assert_eq!(data(engine.digest(session, &plaintext, Some(32)).expect("digest")), digest);
}

#[test]
fn combined_update_without_both_operations_fails() {
    let (engine, session) = logged_in_engine();
    let key = aes_key(&engine, session);
    engine.encrypt_init(session, &cbc_pad(), key).expect("init");
    assert_eq!(
        engine.digest_encrypt_update(session, b"data", Some(16)),
        Err(TokenError::OperationNotInitialized)
    );
}

#[test]
fn operation_state_is_not_supported() {
    let (engine, session) = logged_in_engine();
    assert_eq!(
        engine.operation_state(session),
        Err(TokenError::FunctionNotSupported)
    );
}
