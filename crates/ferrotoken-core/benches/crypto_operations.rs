use criterion::{Criterion, black_box, criterion_group, criterion_main};
use cryptoki_sys::*;
use ferrotoken_core::{
    AttributeTemplate, AttributeValue, Engine, EngineConfig, Handle, Mechanism, MechanismParams,
};

fn logged_in() -> (Engine, Handle) {
    let engine = Engine::new(EngineConfig {
        pin_iterations: 10,
        ..EngineConfig::default()
    })
    .expect("engine");
    engine.init_token(0, b"bench-so", "bench").expect("init token");
    let session = engine
        .open_session(0, CKF_SERIAL_SESSION | CKF_RW_SESSION)
        .expect("session");
    engine.login(session, CKU_SO, b"bench-so").expect("so login");
    engine.init_pin(session, b"bench-user").expect("init pin");
    engine.logout(session).expect("logout");
    engine.login(session, CKU_USER, b"bench-user").expect("login");
    (engine, session)
}

fn bench_aes_gcm_encrypt(c: &mut Criterion) {
    let (engine, session) = logged_in();
    let key = engine
        .generate_key(
            session,
            &Mechanism::new(CKM_AES_KEY_GEN),
            &AttributeTemplate::new().with(CKA_VALUE_LEN, AttributeValue::Ulong(32)),
        )
        .expect("key");
    let mechanism = Mechanism::with_params(
        CKM_AES_GCM,
        MechanismParams::Gcm {
            iv: vec![0; 12],
            aad: Vec::new(),
            tag_bits: 128,
        },
    );
    let plaintext = b"Hello, World! This is a test message for benchmarking.";

    c.bench_function("aes_gcm_encrypt", |b| {
        b.iter(|| {
            engine.encrypt_init(session, &mechanism, key).expect("init");
            black_box(
                engine
                    .encrypt(session, black_box(plaintext), Some(128))
                    .expect("encrypt"),
            )
        })
    });
}

fn bench_ecdsa_sign(c: &mut Criterion) {
    let (engine, session) = logged_in();
    let p256 = vec![0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07];
    let (_, private) = engine
        .generate_key_pair(
            session,
            &Mechanism::new(CKM_EC_KEY_PAIR_GEN),
            &AttributeTemplate::new().with(CKA_EC_PARAMS, AttributeValue::Bytes(p256)),
            &AttributeTemplate::new(),
        )
        .expect("key pair");
    let mechanism = Mechanism::new(CKM_ECDSA_SHA256);
    let payload = b"Hello, World! This is a test message for ECDSA signing.";

    c.bench_function("ecdsa_p256_sign", |b| {
        b.iter(|| {
            engine.sign_init(session, &mechanism, private).expect("init");
            black_box(engine.sign(session, black_box(payload), Some(64)).expect("sign"))
        })
    });
}

fn bench_sha256_digest(c: &mut Criterion) {
    let (engine, session) = logged_in();
    let mechanism = Mechanism::new(CKM_SHA256);
    let payload = vec![0x5a_u8; 4096];

    c.bench_function("sha256_digest_4k", |b| {
        b.iter(|| {
            engine.digest_init(session, &mechanism).expect("init");
            black_box(engine.digest(session, black_box(&payload), Some(32)).expect("digest"))
        })
    });
}

criterion_group!(benches, bench_aes_gcm_encrypt, bench_ecdsa_sign, bench_sha256_digest);
criterion_main!(benches);
