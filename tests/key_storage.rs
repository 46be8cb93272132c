use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ashura_keystore::config::{SCRYPT_PROP, StaticProperties, ToolCommand};
use ashura_keystore::keymaster::soft::INITIAL_BLOB_VERSION;
use ashura_keystore::keymaster::HardwareAuthenticatorType;
use ashura_keystore::layout::{
    FILE_ENCRYPTED_KEY, FILE_KEYMASTER_KEY_BLOB, FILE_SALT, FILE_SECDISCARDABLE, FILE_STRETCHING,
    FILE_VERSION,
};
use ashura_keystore::storage::SALT_BYTES;
use ashura_keystore::{
    Error, HardwareAuthToken, KeyAuthentication, KeyStorage, KeyStorageConfig, MasterKey,
    SecureDeleteConfig, SoftKeymaster,
};
use secrecy::ExposeSecret;
use tempfile::{TempDir, tempdir};
use tracing_subscriber::EnvFilter;
use tracing_test::traced_test;

const KEY: [u8; 32] = [0x42; 32];
const USER: u64 = 0xfeed_beef;

struct Fixture {
    _root: TempDir,
    path: PathBuf,
    keymaster: Arc<SoftKeymaster>,
    storage: KeyStorage,
}

fn fixture_with(secure_delete: SecureDeleteConfig) -> Fixture {
    let root = tempdir().unwrap();
    let path = root.path().join("key");
    let keymaster = Arc::new(SoftKeymaster::new(MasterKey::generate().unwrap()));
    let config = KeyStorageConfig::new(Arc::new(
        StaticProperties::new().with(SCRYPT_PROP, "4:0:0"),
    ))
    .with_secure_delete(secure_delete);
    let storage = KeyStorage::with_keymaster(keymaster.clone(), config);
    Fixture {
        _root: root,
        path,
        keymaster,
        storage,
    }
}

fn fixture() -> Fixture {
    fixture_with(SecureDeleteConfig {
        secdiscard: ToolCommand::new("true", &[]),
        rm: ToolCommand::new("rm", &["-rf", "--"]),
    })
}

fn token(user: u64) -> Vec<u8> {
    HardwareAuthToken {
        version: 0,
        challenge: 0,
        user_id: user,
        authenticator_id: 0,
        authenticator_type: HardwareAuthenticatorType::Password.bits(),
        timestamp: 0,
    }
    .to_bytes()
}

fn read(path: &Path, name: &str) -> Vec<u8> {
    fs::read(path.join(name)).unwrap()
}

fn flip_byte(path: &Path, name: &str, at: usize) {
    let mut data = read(path, name);
    data[at] ^= 0x01;
    fs::write(path.join(name), data).unwrap();
}

#[test]
fn software_round_trip() {
    let f = fixture();
    let auth = KeyAuthentication::with_secret("correct horse");
    f.storage.store_key(&f.path, &auth, &KEY).unwrap();

    assert_eq!(read(&f.path, FILE_STRETCHING), b"none");
    assert!(!f.path.join(FILE_KEYMASTER_KEY_BLOB).exists());

    let key = f.storage.retrieve_key(&f.path, &auth).unwrap();
    assert_eq!(key.expose_secret(), &KEY);
}

#[test]
fn keymaster_round_trip_with_token_and_password() {
    let f = fixture();
    let auth = KeyAuthentication::new(token(USER), "correct horse");
    f.storage.store_key(&f.path, &auth, &KEY).unwrap();

    assert_eq!(read(&f.path, FILE_STRETCHING), b"scrypt 4:0:0");
    assert_eq!(read(&f.path, FILE_SALT).len(), SALT_BYTES);
    assert!(f.path.join(FILE_KEYMASTER_KEY_BLOB).exists());
    assert_eq!(read(&f.path, FILE_ENCRYPTED_KEY).len(), 12 + KEY.len() + 16);

    let key = f.storage.retrieve_key(&f.path, &auth).unwrap();
    assert_eq!(key.expose_secret(), &KEY);
}

#[test]
fn wrong_password_fails_like_corruption() {
    let f = fixture();
    f.storage
        .store_key(&f.path, &KeyAuthentication::with_secret("right"), &KEY)
        .unwrap();
    assert!(matches!(
        f.storage
            .retrieve_key(&f.path, &KeyAuthentication::with_secret("wrong")),
        Err(Error::DecryptionFailed)
    ));

    let g = fixture();
    g.storage
        .store_key(&g.path, &KeyAuthentication::new(token(USER), "right"), &KEY)
        .unwrap();
    assert!(matches!(
        g.storage
            .retrieve_key(&g.path, &KeyAuthentication::new(token(USER), "wrong")),
        Err(Error::DecryptionFailed)
    ));
    assert!(matches!(
        g.storage
            .retrieve_key(&g.path, &KeyAuthentication::with_secret("right")),
        Err(Error::DecryptionFailed)
    ));
}

#[test]
fn token_for_another_user_is_refused() {
    let f = fixture();
    f.storage
        .store_key(&f.path, &KeyAuthentication::new(token(USER), "pw"), &KEY)
        .unwrap();
    let result = f
        .storage
        .retrieve_key(&f.path, &KeyAuthentication::new(token(USER + 1), "pw"));
    assert!(result.is_err());
}

#[test]
fn future_version_is_rejected_before_anything_else() {
    let f = fixture();
    let auth = KeyAuthentication::with_secret("pw");
    f.storage.store_key(&f.path, &auth, &KEY).unwrap();
    fs::write(f.path.join(FILE_VERSION), b"2").unwrap();
    fs::remove_file(f.path.join(FILE_SECDISCARDABLE)).unwrap();

    match f.storage.retrieve_key(&f.path, &auth) {
        Err(Error::VersionMismatch { expected, found }) => {
            assert_eq!(expected, "1");
            assert_eq!(found, "2");
        }
        other => panic!("expected a version mismatch, got {other:?}"),
    }
}

#[test]
fn tampering_with_any_bound_file_fails_retrieval() {
    for (name, at) in [(FILE_ENCRYPTED_KEY, 20), (FILE_SECDISCARDABLE, 1000)] {
        let f = fixture();
        let auth = KeyAuthentication::with_secret("pw");
        f.storage.store_key(&f.path, &auth, &KEY).unwrap();
        flip_byte(&f.path, name, at);
        assert!(
            matches!(
                f.storage.retrieve_key(&f.path, &auth),
                Err(Error::DecryptionFailed)
            ),
            "tampering with {name} went unnoticed"
        );
    }

    let f = fixture();
    let auth = KeyAuthentication::new(token(USER), "pw");
    f.storage.store_key(&f.path, &auth, &KEY).unwrap();
    flip_byte(&f.path, FILE_ENCRYPTED_KEY, 20);
    assert!(matches!(
        f.storage.retrieve_key(&f.path, &auth),
        Err(Error::DecryptionFailed)
    ));
}

#[test]
fn unknown_stretching_is_fatal() {
    let f = fixture();
    let auth = KeyAuthentication::with_secret("pw");
    f.storage.store_key(&f.path, &auth, &KEY).unwrap();
    fs::write(f.path.join(FILE_STRETCHING), b"argon2 1:2:3").unwrap();
    assert!(matches!(
        f.storage.retrieve_key(&f.path, &auth),
        Err(Error::UnknownStretching(_))
    ));
}

#[test]
fn runaway_scrypt_cost_fails_retrieval() {
    let f = fixture();
    let auth = KeyAuthentication::new(token(USER), "pw");
    f.storage.store_key(&f.path, &auth, &KEY).unwrap();
    fs::write(f.path.join(FILE_STRETCHING), b"scrypt 36:3:0").unwrap();
    assert!(matches!(
        f.storage.retrieve_key(&f.path, &auth),
        Err(Error::InvalidScryptParams(_))
    ));
}

#[test]
fn runaway_configured_scrypt_cost_fails_store() {
    let root = tempdir().unwrap();
    let keymaster = Arc::new(SoftKeymaster::new(MasterKey::generate().unwrap()));
    let config = KeyStorageConfig::new(Arc::new(
        StaticProperties::new().with(SCRYPT_PROP, "36:3:0"),
    ));
    let storage = KeyStorage::with_keymaster(keymaster, config);
    assert!(matches!(
        storage.store_key(
            root.path().join("key"),
            &KeyAuthentication::new(token(USER), "pw"),
            &KEY
        ),
        Err(Error::InvalidScryptParams(_))
    ));
}

#[test]
#[traced_test]
fn nopassword_keys_have_no_salt_and_ignore_secrets() {
    let f = fixture();
    f.storage
        .store_key(&f.path, &KeyAuthentication::empty(), &KEY)
        .unwrap();
    assert_eq!(read(&f.path, FILE_STRETCHING), b"nopassword");
    assert!(!f.path.join(FILE_SALT).exists());
    assert!(f.path.join(FILE_KEYMASTER_KEY_BLOB).exists());

    let key = f
        .storage
        .retrieve_key(&f.path, &KeyAuthentication::empty())
        .unwrap();
    assert_eq!(key.expose_secret(), &KEY);

    let with_secret = KeyAuthentication::new(token(USER), "ignored");
    let key = f.storage.retrieve_key(&f.path, &with_secret).unwrap();
    assert_eq!(key.expose_secret(), &KEY);
    assert!(logs_contain("Password present but stretching is nopassword"));
}

#[test]
#[traced_test]
fn upgrade_is_transparent() {
    let f = fixture();
    let auth = KeyAuthentication::new(token(USER), "pw");
    f.storage.store_key(&f.path, &auth, &KEY).unwrap();
    let before = read(&f.path, FILE_KEYMASTER_KEY_BLOB);

    f.keymaster.set_blob_version(INITIAL_BLOB_VERSION + 1);
    let key = f.storage.retrieve_key(&f.path, &auth).unwrap();
    assert_eq!(key.expose_secret(), &KEY);
    assert!(logs_contain("Key upgraded"));

    let after = read(&f.path, FILE_KEYMASTER_KEY_BLOB);
    assert_ne!(before, after);

    let key = f.storage.retrieve_key(&f.path, &auth).unwrap();
    assert_eq!(key.expose_secret(), &KEY);
    assert_eq!(read(&f.path, FILE_KEYMASTER_KEY_BLOB), after);
}

#[test]
fn destroy_keeps_going_after_keymaster_failure() {
    let f = fixture();
    let auth = KeyAuthentication::new(token(USER), "pw");
    f.storage.store_key(&f.path, &auth, &KEY).unwrap();
    fs::write(f.path.join(FILE_KEYMASTER_KEY_BLOB), b"not a blob").unwrap();

    let report = f.storage.destroy_key(&f.path);
    assert!(!report.keymaster_key_deleted);
    assert!(report.secure_overwrite);
    assert!(report.directory_removed);
    assert!(!report.is_complete());
    assert!(!f.path.exists());
}

#[test]
fn destroyed_keymaster_key_cannot_be_restored_from_backup() {
    let f = fixture();
    let auth = KeyAuthentication::empty();
    f.storage.store_key(&f.path, &auth, &KEY).unwrap();

    let backup = f.path.with_file_name("backup");
    fs::create_dir(&backup).unwrap();
    for entry in fs::read_dir(&f.path).unwrap() {
        let entry = entry.unwrap();
        fs::copy(entry.path(), backup.join(entry.file_name())).unwrap();
    }

    let report = f.storage.destroy_key(&f.path);
    assert!(report.is_complete(), "{report:?}");
    assert!(!f.path.exists());

    assert!(f.storage.retrieve_key(&backup, &auth).is_err());
}

#[cfg(target_os = "linux")]
#[test]
fn destroy_with_default_tools() {
    let f = fixture_with(SecureDeleteConfig::default());
    let auth = KeyAuthentication::with_secret("pw");
    f.storage.store_key(&f.path, &auth, &KEY).unwrap();

    let report = f.storage.destroy_key(&f.path);
    assert!(report.is_complete(), "{report:?}");
    assert!(!f.path.exists());
}

#[test]
fn storage_without_keymaster_only_handles_software_keys() {
    let root = tempdir().unwrap();
    let storage = KeyStorage::new(KeyStorageConfig::new(Arc::new(
        StaticProperties::new().with(SCRYPT_PROP, "4:0:0"),
    )));

    let software = root.path().join("software");
    let auth = KeyAuthentication::with_secret("pw");
    storage.store_key(&software, &auth, &KEY).unwrap();
    assert_eq!(
        storage.retrieve_key(&software, &auth).unwrap().expose_secret(),
        &KEY
    );

    assert!(matches!(
        storage.store_key(
            root.path().join("hardware"),
            &KeyAuthentication::new(token(USER), "pw"),
            &KEY
        ),
        Err(Error::KeymasterUnavailable)
    ));
}

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn trace_logs_never_carry_secrets() {
    let capture = Capture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("ashura_keystore=trace"))
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();

    let f = fixture();
    let password = "hunter2-correct-horse";
    let auth = KeyAuthentication::new(token(USER), password);
    tracing::subscriber::with_default(subscriber, || {
        f.storage.store_key(&f.path, &auth, &KEY).unwrap();
        f.keymaster.set_blob_version(INITIAL_BLOB_VERSION + 1);
        f.storage.retrieve_key(&f.path, &auth).unwrap();
        f.storage.destroy_key(&f.path);
    });

    let logs = capture.contents();
    assert!(logs.contains("Key upgraded"), "{logs}");
    assert!(!logs.contains(password));
    assert!(!logs.contains("66, 66, 66"));
    assert!(!logs.contains("424242"));
}
