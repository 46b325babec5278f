use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cryptoki_sys::*;
use ferrotoken_core::store::{ObjectRecord, TokenRecord};
use ferrotoken_core::{
    AttributeLookup, AttributeTemplate, AttributeValue, Engine, EngineConfig, Handle, Mechanism,
    MechanismParams, MemoryTokenStore, OsRandom, Output, QuoteProvider, SlotId, SoftwareCrypto,
    StorageKey, TokenError, TokenResult, TokenStore,
};
use uuid::Uuid;

const P256: [u8; 10] = [0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07];

fn engine() -> Engine {
    let engine = Engine::new(EngineConfig {
        pin_iterations: 10,
        ..EngineConfig::default()
    })
    .expect("engine");
    engine.init_token(0, b"so-secret", "keys").expect("init token");
    engine
}

fn user_session(engine: &Engine) -> Handle {
    let session = engine
        .open_session(0, CKF_SERIAL_SESSION | CKF_RW_SESSION)
        .expect("session");
    engine.login(session, CKU_SO, b"so-secret").expect("so login");
    engine.init_pin(session, b"user-pin").expect("init pin");
    engine.logout(session).expect("logout");
    engine.login(session, CKU_USER, b"user-pin").expect("user login");
    session
}

fn secret(
    engine: &Engine,
    session: Handle,
    len: CK_ULONG,
    extra: &[(CK_ATTRIBUTE_TYPE, AttributeValue)],
) -> Handle {
    let mut template = AttributeTemplate::new()
        .with(CKA_KEY_TYPE, AttributeValue::Ulong(CKK_AES))
        .with(CKA_VALUE_LEN, AttributeValue::Ulong(len));
    for (id, value) in extra {
        template.push(*id, value.clone());
    }
    engine
        .generate_key(session, &Mechanism::new(CKM_AES_KEY_GEN), &template)
        .expect("secret key")
}

fn value(engine: &Engine, session: Handle, key: Handle, attribute: CK_ATTRIBUTE_TYPE) -> AttributeLookup {
    engine
        .attribute_values(session, key, &[attribute])
        .expect("attributes")
        .remove(0)
}

fn unwrap_template() -> AttributeTemplate {
    AttributeTemplate::new()
        .with(CKA_CLASS, AttributeValue::Ulong(CKO_SECRET_KEY))
        .with(CKA_KEY_TYPE, AttributeValue::Ulong(CKK_AES))
        .with(CKA_ENCRYPT, AttributeValue::Bool(true))
}

#[test]
fn generated_key_has_lifecycle_attributes() {
    let engine = engine();
    let session = user_session(&engine);
    let key = secret(
        &engine,
        session,
        32,
        &[(CKA_SENSITIVE, AttributeValue::Bool(true))],
    );
    assert_eq!(
        value(&engine, session, key, CKA_LOCAL),
        AttributeLookup::Value(vec![1])
    );
    assert_eq!(
        value(&engine, session, key, CKA_ALWAYS_SENSITIVE),
        AttributeLookup::Value(vec![1])
    );
    assert_eq!(value(&engine, session, key, CKA_VALUE), AttributeLookup::Sensitive);
    assert_eq!(
        value(&engine, session, key, CKA_MODULUS),
        AttributeLookup::Invalid
    );

    let bad = AttributeTemplate::new().with(CKA_VALUE_LEN, AttributeValue::Ulong(20));
    assert_eq!(
        engine.generate_key(session, &Mechanism::new(CKM_AES_KEY_GEN), &bad),
        Err(TokenError::KeySizeRange)
    );
    assert_eq!(
        engine.generate_key(session, &Mechanism::new(CKM_AES_KEY_GEN), &AttributeTemplate::new()),
        Err(TokenError::TemplateIncomplete)
    );
}

#[test]
fn aes_key_wrap_round_trip_preserves_key() {
    let engine = engine();
    let session = user_session(&engine);
    let kek = secret(&engine, session, 32, &[]);
    let target = secret(&engine, session, 16, &[]);
    let mechanism = Mechanism::new(CKM_AES_KEY_WRAP);

    assert_eq!(
        engine.wrap_key(session, &mechanism, kek, target, None),
        Ok(Output::Required(24))
    );
    let wrapped = engine
        .wrap_key(session, &mechanism, kek, target, Some(24))
        .expect("wrap")
        .into_data()
        .expect("data");
    let restored = engine
        .unwrap_key(session, &mechanism, kek, &wrapped, &unwrap_template())
        .expect("unwrap");

    assert_eq!(
        value(&engine, session, restored, CKA_CHECK_VALUE),
        value(&engine, session, target, CKA_CHECK_VALUE)
    );
    assert_eq!(
        value(&engine, session, restored, CKA_VALUE),
        value(&engine, session, target, CKA_VALUE)
    );
    assert_eq!(
        value(&engine, session, restored, CKA_LOCAL),
        AttributeLookup::Value(vec![0])
    );
}

#[test]
fn cbc_pad_and_padded_wrap_handle_odd_lengths() {
    let engine = engine();
    let session = user_session(&engine);
    let kek = secret(&engine, session, 16, &[]);
    let target = secret(&engine, session, 24, &[]);
    for mechanism in [
        Mechanism::new(CKM_AES_KEY_WRAP_PAD),
        Mechanism::with_params(CKM_AES_CBC_PAD, MechanismParams::Iv(vec![5; 16])),
    ] {
        let wrapped = engine
            .wrap_key(session, &mechanism, kek, target, Some(64))
            .expect("wrap")
            .into_data()
            .expect("data");
        let restored = engine
            .unwrap_key(session, &mechanism, kek, &wrapped, &unwrap_template())
            .expect("unwrap");
        assert_eq!(
            value(&engine, session, restored, CKA_VALUE_LEN),
            value(&engine, session, target, CKA_VALUE_LEN)
        );
    }
}

#[test]
fn wrap_refuses_unextractable_target_and_unwrap_rejects_garbage() {
    let engine = engine();
    let session = user_session(&engine);
    let kek = secret(&engine, session, 32, &[]);
    let locked = secret(
        &engine,
        session,
        16,
        &[(CKA_EXTRACTABLE, AttributeValue::Bool(false))],
    );
    let mechanism = Mechanism::new(CKM_AES_KEY_WRAP);
    assert_eq!(
        engine.wrap_key(session, &mechanism, kek, locked, Some(64)),
        Err(TokenError::KeyUnextractable)
    );

    let no_wrap = secret(
        &engine,
        session,
        32,
        &[(CKA_WRAP, AttributeValue::Bool(false))],
    );
    assert_eq!(
        engine.wrap_key(session, &mechanism, no_wrap, kek, Some(64)),
        Err(TokenError::KeyFunctionNotPermitted)
    );
    assert_eq!(
        engine.wrap_key(session, &mechanism, Handle::from_raw(0xdead), kek, Some(64)),
        Err(TokenError::WrappingKeyHandleInvalid)
    );

    assert_eq!(
        engine.unwrap_key(session, &mechanism, kek, &[0x11; 24], &unwrap_template()),
        Err(TokenError::WrappedKeyInvalid)
    );
    assert_eq!(
        engine.unwrap_key(session, &mechanism, kek, &[0x11; 20], &unwrap_template()),
        Err(TokenError::WrappedKeyLenRange)
    );
}

#[test]
fn rsa_oaep_wraps_secret_keys() {
    let engine = engine();
    let session = user_session(&engine);
    let public = AttributeTemplate::new().with(CKA_MODULUS_BITS, AttributeValue::Ulong(1024));
    let (public_key, private_key) = engine
        .generate_key_pair(
            session,
            &Mechanism::new(CKM_RSA_PKCS_KEY_PAIR_GEN),
            &public,
            &AttributeTemplate::new(),
        )
        .expect("rsa pair");
    let target = secret(&engine, session, 32, &[]);
    let mechanism = Mechanism::with_params(
        CKM_RSA_PKCS_OAEP,
        MechanismParams::Oaep {
            hash: CKM_SHA256,
            mgf: CKG_MGF1_SHA256,
            source: CKZ_DATA_SPECIFIED,
            label: Vec::new(),
        },
    );
    let wrapped = engine
        .wrap_key(session, &mechanism, public_key, target, Some(128))
        .expect("wrap")
        .into_data()
        .expect("data");
    assert_eq!(wrapped.len(), 128);
    let restored = engine
        .unwrap_key(session, &mechanism, private_key, &wrapped, &unwrap_template())
        .expect("unwrap");
    assert_eq!(
        value(&engine, session, restored, CKA_VALUE),
        value(&engine, session, target, CKA_VALUE)
    );
    assert_eq!(
        engine.wrap_key(session, &mechanism, public_key, private_key, Some(4096)),
        Err(TokenError::KeyUnextractable)
    );
}

fn ec_pair(engine: &Engine, session: Handle) -> (Handle, Handle) {
    let public = AttributeTemplate::new().with(CKA_EC_PARAMS, AttributeValue::Bytes(P256.to_vec()));
    let private = AttributeTemplate::new().with(CKA_DERIVE, AttributeValue::Bool(true));
    engine
        .generate_key_pair(session, &Mechanism::new(CKM_EC_KEY_PAIR_GEN), &public, &private)
        .expect("ec pair")
}

#[test]
fn ecdh_derivation_agrees_on_both_sides() {
    let engine = engine();
    let session = user_session(&engine);
    let (alice_public, alice_private) = ec_pair(&engine, session);
    let (bob_public, bob_private) = ec_pair(&engine, session);
    let point = |key| match value(&engine, session, key, CKA_EC_POINT) {
        AttributeLookup::Value(bytes) => bytes,
        other => panic!("EC point unreadable: {other:?}"),
    };
    let template = AttributeTemplate::new()
        .with(CKA_CLASS, AttributeValue::Ulong(CKO_SECRET_KEY))
        .with(CKA_KEY_TYPE, AttributeValue::Ulong(CKK_GENERIC_SECRET))
        .with(CKA_VALUE_LEN, AttributeValue::Ulong(24));
    let derive = |base, peer| {
        let mechanism = Mechanism::with_params(
            CKM_ECDH1_DERIVE,
            MechanismParams::Ecdh {
                kdf: CKD_SHA256_KDF,
                shared_data: b"context".to_vec(),
                public_data: peer,
            },
        );
        engine
            .derive_key(session, &mechanism, base, &template)
            .expect("derive")
    };
    let ours = derive(alice_private, point(bob_public));
    let theirs = derive(bob_private, point(alice_public));
    let ours_value = value(&engine, session, ours, CKA_VALUE);
    assert_eq!(ours_value, value(&engine, session, theirs, CKA_VALUE));
    assert!(matches!(ours_value, AttributeLookup::Value(ref bytes) if bytes.len() == 24));
}

#[test]
fn derive_requires_derive_usage() {
    let engine = engine();
    let session = user_session(&engine);
    let base = secret(&engine, session, 16, &[]);
    let mechanism = Mechanism::with_params(
        CKM_AES_ECB_ENCRYPT_DATA,
        MechanismParams::DeriveData(vec![3; 32]),
    );
    assert_eq!(
        engine.derive_key(session, &mechanism, base, &AttributeTemplate::new()),
        Err(TokenError::KeyFunctionNotPermitted)
    );

    let base = secret(
        &engine,
        session,
        16,
        &[(CKA_DERIVE, AttributeValue::Bool(true))],
    );
    let derived = engine
        .derive_key(
            session,
            &mechanism,
            base,
            &AttributeTemplate::new().with(CKA_KEY_TYPE, AttributeValue::Ulong(CKK_AES)),
        )
        .expect("derive");
    assert_eq!(
        value(&engine, session, derived, CKA_VALUE_LEN),
        AttributeLookup::Value(AttributeValue::Ulong(32).encode())
    );
}

#[test]
fn derived_key_inherits_base_lifecycle_guarantees() {
    let engine = engine();
    let session = user_session(&engine);
    let mechanism = Mechanism::with_params(
        CKM_AES_ECB_ENCRYPT_DATA,
        MechanismParams::DeriveData(vec![3; 32]),
    );
    let locked = AttributeTemplate::new()
        .with(CKA_KEY_TYPE, AttributeValue::Ulong(CKK_AES))
        .with(CKA_EXTRACTABLE, AttributeValue::Bool(false));

    let extractable_base = secret(
        &engine,
        session,
        16,
        &[(CKA_DERIVE, AttributeValue::Bool(true))],
    );
    let derived = engine
        .derive_key(session, &mechanism, extractable_base, &locked)
        .expect("derive");
    assert_eq!(
        value(&engine, session, derived, CKA_NEVER_EXTRACTABLE),
        AttributeLookup::Value(vec![0])
    );

    let locked_base = secret(
        &engine,
        session,
        16,
        &[
            (CKA_DERIVE, AttributeValue::Bool(true)),
            (CKA_EXTRACTABLE, AttributeValue::Bool(false)),
        ],
    );
    let derived = engine
        .derive_key(session, &mechanism, locked_base, &locked)
        .expect("derive");
    assert_eq!(
        value(&engine, session, derived, CKA_NEVER_EXTRACTABLE),
        AttributeLookup::Value(vec![1])
    );
}

#[test]
fn aes_key_wrap_rejects_unaligned_key_as_key_size() {
    let engine = engine();
    let session = user_session(&engine);
    let kek = secret(&engine, session, 32, &[]);
    let template = AttributeTemplate::new()
        .with(CKA_KEY_TYPE, AttributeValue::Ulong(CKK_GENERIC_SECRET))
        .with(CKA_VALUE_LEN, AttributeValue::Ulong(20));
    let target = engine
        .generate_key(session, &Mechanism::new(CKM_GENERIC_SECRET_KEY_GEN), &template)
        .expect("generic secret");

    assert_eq!(
        engine.wrap_key(session, &Mechanism::new(CKM_AES_KEY_WRAP), kek, target, Some(64)),
        Err(TokenError::KeySizeRange)
    );
}

/// Delegates to memory but refuses to persist private keys, and optionally
/// refuses deletes too.
struct FailingStore {
    inner: MemoryTokenStore,
    refuse_deletes: AtomicBool,
}

impl FailingStore {
    fn new(refuse_deletes: bool) -> Self {
        Self {
            inner: MemoryTokenStore::new(),
            refuse_deletes: AtomicBool::new(refuse_deletes),
        }
    }
}

impl TokenStore for FailingStore {
    fn load_token(&self, slot: SlotId) -> TokenResult<Option<TokenRecord>> {
        self.inner.load_token(slot)
    }

    fn save_token(&self, record: &TokenRecord) -> TokenResult<()> {
        self.inner.save_token(record)
    }

    fn load_objects(&self, slot: SlotId) -> TokenResult<Vec<ObjectRecord>> {
        self.inner.load_objects(slot)
    }

    fn save_object(&self, record: &ObjectRecord) -> TokenResult<()> {
        if record.attributes.ulong(CKA_CLASS) == Some(CKO_PRIVATE_KEY) {
            return Err(TokenError::device("disk full"));
        }
        self.inner.save_object(record)
    }

    fn delete_object(&self, slot: SlotId, id: Uuid) -> TokenResult<()> {
        if self.refuse_deletes.load(Ordering::SeqCst) {
            return Err(TokenError::device("read-only medium"));
        }
        self.inner.delete_object(slot, id)
    }

    fn clear_objects(&self, slot: SlotId) -> TokenResult<()> {
        self.inner.clear_objects(slot)
    }
}

fn failing_engine(refuse_deletes: bool) -> Engine {
    let engine = Engine::with_collaborators(
        EngineConfig {
            pin_iterations: 10,
            ..EngineConfig::default()
        },
        Arc::new(FailingStore::new(refuse_deletes)),
        Arc::new(SoftwareCrypto::new()),
        Arc::new(OsRandom),
        StorageKey::random(&OsRandom).expect("storage key"),
    )
    .expect("engine");
    engine.init_token(0, b"so-secret", "keys").expect("init token");
    engine
}

fn token_pair(engine: &Engine, session: Handle) -> TokenResult<(Handle, Handle)> {
    let public = AttributeTemplate::new()
        .with(CKA_TOKEN, AttributeValue::Bool(true))
        .with(CKA_EC_PARAMS, AttributeValue::Bytes(P256.to_vec()));
    let private = AttributeTemplate::new()
        .with(CKA_TOKEN, AttributeValue::Bool(true))
        .with(CKA_SIGN, AttributeValue::Bool(true));
    engine.generate_key_pair(session, &Mechanism::new(CKM_EC_KEY_PAIR_GEN), &public, &private)
}

fn public_keys(engine: &Engine, session: Handle) -> usize {
    let template =
        AttributeTemplate::new().with(CKA_CLASS, AttributeValue::Ulong(CKO_PUBLIC_KEY));
    engine.find_objects_init(session, &template).expect("find init");
    let found = engine.find_objects(session, usize::MAX).expect("find");
    engine.find_objects_final(session).expect("find final");
    found.len()
}

#[test]
fn failed_key_pair_leaves_no_public_half() {
    let engine = failing_engine(false);
    let session = user_session(&engine);
    assert_eq!(
        token_pair(&engine, session),
        Err(TokenError::DeviceError("disk full".to_string()))
    );
    assert_eq!(public_keys(&engine, session), 0);
}

#[test]
fn failed_rollback_is_reported_not_swallowed() {
    let engine = failing_engine(true);
    let session = user_session(&engine);
    assert!(matches!(
        token_pair(&engine, session),
        Err(TokenError::GeneralError(message)) if message.contains("rollback")
    ));
}

#[test]
fn find_returns_matches_in_batches() {
    let engine = engine();
    let session = user_session(&engine);
    let template = AttributeTemplate::new()
        .with(CKA_CLASS, AttributeValue::Ulong(CKO_DATA))
        .with(CKA_APPLICATION, AttributeValue::Bytes(b"batch".to_vec()));
    for _ in 0..5 {
        engine.create_object(session, &template).expect("create");
    }
    engine.find_objects_init(session, &template).expect("init");
    assert_eq!(
        engine.find_objects_init(session, &template),
        Err(TokenError::OperationActive)
    );
    let batches: Vec<usize> = (0..4)
        .map(|_| engine.find_objects(session, 2).expect("find").len())
        .collect();
    assert_eq!(batches, vec![2, 2, 1, 0]);
    engine.find_objects_final(session).expect("final");
    assert_eq!(
        engine.find_objects(session, 2),
        Err(TokenError::OperationNotInitialized)
    );
}

#[test]
fn closing_session_removes_its_objects() {
    let engine = engine();
    let keeper = user_session(&engine);
    let temporary = engine
        .open_session(0, CKF_SERIAL_SESSION | CKF_RW_SESSION)
        .expect("session");
    let template = AttributeTemplate::new().with(CKA_CLASS, AttributeValue::Ulong(CKO_DATA));
    let object = engine.create_object(temporary, &template).expect("create");
    assert!(engine.object_size(keeper, object).is_ok());

    engine.close_session(temporary).expect("close");
    assert_eq!(
        engine.object_size(keeper, object),
        Err(TokenError::ObjectHandleInvalid)
    );
    assert_eq!(
        engine.close_session(temporary),
        Err(TokenError::SessionHandleInvalid)
    );
}

#[test]
fn copy_respects_copyable_and_set_is_atomic() {
    let engine = engine();
    let session = user_session(&engine);
    let key = secret(&engine, session, 16, &[]);
    let copy = engine
        .copy_object(
            session,
            key,
            &AttributeTemplate::new().with(CKA_LABEL, AttributeValue::Bytes(b"copy".to_vec())),
        )
        .expect("copy");
    assert_eq!(
        value(&engine, session, copy, CKA_CHECK_VALUE),
        value(&engine, session, key, CKA_CHECK_VALUE)
    );

    let invalid = AttributeTemplate::new()
        .with(CKA_LABEL, AttributeValue::Bytes(b"renamed".to_vec()))
        .with(CKA_KEY_TYPE, AttributeValue::Ulong(CKK_GENERIC_SECRET));
    assert!(engine.set_attribute_values(session, copy, &invalid).is_err());
    assert_eq!(
        value(&engine, session, copy, CKA_LABEL),
        AttributeLookup::Value(b"copy".to_vec())
    );
}

struct FixedQuote;

impl QuoteProvider for FixedQuote {
    fn quote(&self, report_data: &[u8]) -> TokenResult<Vec<u8>> {
        let mut quote = b"QUOTE".to_vec();
        quote.extend_from_slice(report_data);
        Ok(quote)
    }
}

#[test]
fn attestation_appends_quote_to_public_encoding() {
    let engine = engine();
    let session = user_session(&engine);
    let (public, _) = ec_pair(&engine, session);
    assert_eq!(
        engine.attest_public_key(session, public, Some(1024)),
        Err(TokenError::FunctionNotSupported)
    );

    let engine = engine.with_quote_provider(Arc::new(FixedQuote));
    let required = match engine.attest_public_key(session, public, None).expect("size query") {
        Output::Required(len) => len,
        Output::Data(_) => panic!("size query returned data"),
    };
    // 65 byte uncompressed point, then the marker and a SHA-256 digest.
    assert_eq!(required, 65 + 5 + 32);
    let blob = engine
        .attest_public_key(session, public, Some(required))
        .expect("attest")
        .into_data()
        .expect("data");
    assert_eq!(&blob[65..70], b"QUOTE");
}
