use super::*;
use crate::error::CastvaultError;

fn test_master_key() -> [u8; MASTER_KEY_LEN] {
    let mut key = [0u8; MASTER_KEY_LEN];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = i as u8;
    }
    key
}

fn test_cipher() -> EnvelopeCipher {
    EnvelopeCipher::new(&test_master_key(), None).unwrap()
}

// Fernet reference token: key, token and plaintext from the Fernet spec vectors
const FERNET_KEY: &str = "cw_0x689RpI-jtRR7oE8h_eQsKImvJapLeSbXpwF4e4=";
const FERNET_TOKEN: &str = "gAAAAAAdwJ6wAAECAwQFBgcICQoLDA0ODy021cpGVWKZ_eEwCGM4BLLF_5CV9dOPmrhuVUPgJobwOz7JcbmrR64jVmpU4IwqDA==";

// Version 1 envelope of "ya29.access-token" under key 00..1f,
// salt a0..af and iv 10..1f, produced by an independent implementation
const V1_VECTOR: &str = "AaChoqOkpaanqKmqq6ytrq8QERITFBUWFxgZGhscHR4fXzhmMFUPAgem3nS8U5ejfEOZ1uoD9kq86z3Xx304QcEEZnrLh0WJfMLXYr0s4L4FLNPwS/S/mS9d1gj6xsSD2g==";

fn vector_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    for (i, byte) in salt.iter_mut().enumerate() {
        *byte = 0xA0 + i as u8;
    }
    salt
}

fn vector_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    for (i, byte) in iv.iter_mut().enumerate() {
        *byte = 0x10 + i as u8;
    }
    iv
}

fn legacy_cipher() -> EnvelopeCipher {
    let legacy = parse_legacy_key(FERNET_KEY).unwrap();
    EnvelopeCipher::new(&test_master_key(), Some(legacy.as_slice())).unwrap()
}

mod round_trip_tests {
    use super::*;

    #[test]
    fn test_round_trip_ascii_and_utf8() {
        let cipher = test_cipher();
        let samples = [
            "",
            "a",
            "exactly sixteen!",
            "ya29.a0AfH6SMBx-long-google-access-token_with/odd+chars=",
            "токен доступа",
            "アクセストークン🔑",
        ];

        for sample in samples {
            let envelope = cipher.encrypt(sample).unwrap();
            let decrypted = cipher.decrypt(&envelope).unwrap();
            assert_eq!(decrypted.expose_secret(), sample);
        }
    }

    #[test]
    fn test_one_shot_helpers_round_trip() {
        let key = test_master_key();
        let envelope = encrypt("refresh-token-value", &key).unwrap();
        assert_eq!(decrypt(&envelope, &key).unwrap().expose_secret(), "refresh-token-value");
    }

    #[test]
    fn test_encryption_is_randomized() {
        let cipher = test_cipher();
        let first = cipher.encrypt("same token").unwrap();
        let second = cipher.encrypt("same token").unwrap();
        assert_ne!(first, second, "salt and IV must be fresh per envelope");
    }

    #[test]
    fn test_envelope_layout() {
        let cipher = test_cipher();
        let envelope = cipher.encrypt("exactly sixteen!").unwrap();
        let raw = STANDARD.decode(&envelope).unwrap();

        assert_eq!(raw[0], EnvelopeVersion::V1_MARKER);
        // A full block of padding follows a block-aligned plaintext
        assert_eq!(raw.len(), 1 + SALT_LEN + IV_LEN + 32 + MAC_LEN);
        assert_eq!(envelope_version(&envelope).unwrap(), EnvelopeVersion::V1);
    }

    #[test]
    fn test_known_vector_decrypts() {
        let cipher = test_cipher();
        let decrypted = cipher.decrypt(V1_VECTOR).unwrap();
        assert_eq!(decrypted.expose_secret(), "ya29.access-token");
    }

    #[test]
    fn test_known_vector_is_reproduced_bit_exact() {
        let cipher = test_cipher();
        let raw = cipher
            .seal_v1(b"ya29.access-token", &vector_salt(), &vector_iv())
            .unwrap();
        assert_eq!(STANDARD.encode(raw), V1_VECTOR);
    }
}

mod integrity_tests {
    use super::*;

    #[test]
    fn test_every_bit_flip_in_ciphertext_and_mac_is_rejected() {
        let cipher = test_cipher();
        let raw = STANDARD.decode(cipher.encrypt("oauth-access-token").unwrap()).unwrap();

        let salt = &raw[1..1 + SALT_LEN];
        let key = derive_key(&test_master_key(), salt);
        let iv = &raw[1 + SALT_LEN..V1_HEADER_LEN];

        for byte in V1_HEADER_LEN..raw.len() {
            for bit in 0..8 {
                let mut tampered = raw.clone();
                tampered[byte] ^= 1 << bit;
                let (ciphertext, mac) =
                    tampered[V1_HEADER_LEN..].split_at(tampered.len() - V1_HEADER_LEN - MAC_LEN);

                match open_with_key(&key, iv, ciphertext, mac) {
                    Err(CastvaultError::Cipher(CipherError::Integrity(_))) => {}
                    other => panic!(
                        "flip at byte {} bit {} was not rejected: {:?}",
                        byte,
                        bit,
                        other.map(|_| "plaintext returned")
                    ),
                }
            }
        }
    }

    #[test]
    fn test_flips_through_full_decrypt_path() {
        let cipher = test_cipher();
        let raw = STANDARD.decode(cipher.encrypt("oauth-access-token").unwrap()).unwrap();

        // salt, iv, first ciphertext byte, last mac byte
        for position in [1, 1 + SALT_LEN, V1_HEADER_LEN, raw.len() - 1] {
            let mut tampered = raw.clone();
            tampered[position] ^= 0x01;
            let result = cipher.decrypt(&STANDARD.encode(&tampered));
            assert!(
                matches!(result, Err(CastvaultError::Cipher(CipherError::Integrity(_)))),
                "tamper at {} should be an integrity failure",
                position
            );
        }
    }

    #[test]
    fn test_wrong_master_key_is_integrity_failure() {
        let envelope = test_cipher().encrypt("secret").unwrap();
        let other = EnvelopeCipher::new(&[0xEE; MASTER_KEY_LEN], None).unwrap();

        let result = other.decrypt(&envelope);
        assert!(matches!(
            result,
            Err(CastvaultError::Cipher(CipherError::Integrity(_)))
        ));
    }
}

mod format_tests {
    use super::*;

    #[test]
    fn test_unknown_version_is_format_error_for_any_length() {
        let cipher = test_cipher();

        for marker in [0x00u8, 0x02, 0x7F, 0x81, 0xFF] {
            for len in [1usize, 10, 97, 300] {
                let mut raw = vec![0x5Au8; len];
                raw[0] = marker;
                let result = cipher.decrypt(&STANDARD.encode(&raw));
                assert!(
                    matches!(result, Err(CastvaultError::Cipher(CipherError::Format(_)))),
                    "marker 0x{:02x} len {} should be a format error",
                    marker,
                    len
                );
            }
        }
    }

    #[test]
    fn test_unknown_version_is_rejected_by_migration() {
        let cipher = legacy_cipher();
        let raw = vec![0x02u8; 97];
        let result = cipher.migrate_legacy(&STANDARD.encode(raw));
        assert!(matches!(
            result,
            Err(CastvaultError::Cipher(CipherError::Format(_)))
        ));
    }

    #[test]
    fn test_truncated_v1_is_format_error() {
        let cipher = test_cipher();
        let raw = STANDARD.decode(cipher.encrypt("token").unwrap()).unwrap();
        let truncated = &raw[..V1_MIN_LEN - 1];

        let result = cipher.decrypt(&STANDARD.encode(truncated));
        assert!(matches!(
            result,
            Err(CastvaultError::Cipher(CipherError::Format(_)))
        ));
    }

    #[test]
    fn test_empty_and_non_base64_input() {
        let cipher = test_cipher();

        for input in ["", "   ", "not base64 at all!", "%%%%"] {
            let result = cipher.decrypt(input);
            assert!(
                matches!(result, Err(CastvaultError::Cipher(CipherError::Format(_)))),
                "input {:?} should be a format error",
                input
            );
        }
    }
}

mod key_tests {
    use super::*;

    #[test]
    fn test_master_key_must_be_32_bytes() {
        for len in [0usize, 16, 31, 33, 64] {
            let key = vec![1u8; len];
            let result = EnvelopeCipher::new(&key, None);
            assert!(
                matches!(result, Err(CastvaultError::Config(ConfigError::InvalidKey(_)))),
                "{}-byte key should be rejected",
                len
            );
        }
    }

    #[test]
    fn test_one_shot_encrypt_rejects_short_key() {
        let result = encrypt("token", &[0u8; 16]);
        assert!(matches!(
            result,
            Err(CastvaultError::Config(ConfigError::InvalidKey(_)))
        ));
    }

    #[test]
    fn test_parse_master_key_hex_and_base64() {
        let hex_key = "00".repeat(16) + &"ff".repeat(16);
        let parsed = parse_master_key(&hex_key).unwrap();
        assert_eq!(parsed.len(), MASTER_KEY_LEN);
        assert_eq!(parsed[31], 0xFF);

        let generated = generate_master_key();
        let parsed = parse_master_key(&generated).unwrap();
        assert_eq!(parsed.len(), MASTER_KEY_LEN);
    }

    #[test]
    fn test_parse_master_key_rejects_wrong_length() {
        let short = STANDARD.encode([9u8; 16]);
        assert!(matches!(
            parse_master_key(&short),
            Err(CastvaultError::Config(ConfigError::InvalidKey(_)))
        ));
        assert!(parse_master_key("definitely not a key").is_err());
    }

    #[test]
    fn test_debug_output_is_redacted() {
        let cipher = legacy_cipher();
        let debug = format!("{:?}", cipher);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("31"), "key bytes must not be printed: {}", debug);
    }
}

mod legacy_tests {
    use super::*;

    #[test]
    fn test_fernet_reference_token_decrypts() {
        let cipher = legacy_cipher();
        assert_eq!(envelope_version(FERNET_TOKEN).unwrap(), EnvelopeVersion::Legacy);
        assert_eq!(cipher.decrypt(FERNET_TOKEN).unwrap().expose_secret(), "hello");
    }

    #[test]
    fn test_legacy_without_key_is_config_error() {
        let cipher = test_cipher();
        let result = cipher.decrypt(FERNET_TOKEN);
        assert!(matches!(
            result,
            Err(CastvaultError::Config(ConfigError::LegacyKeyMissing))
        ));

        let result = cipher.migrate_legacy(FERNET_TOKEN);
        assert!(matches!(
            result,
            Err(CastvaultError::Config(ConfigError::LegacyKeyMissing))
        ));
    }

    #[test]
    fn test_migrate_legacy_produces_v1() {
        let cipher = legacy_cipher();
        let migrated = cipher.migrate_legacy(FERNET_TOKEN).unwrap();

        assert_eq!(envelope_version(&migrated).unwrap(), EnvelopeVersion::V1);
        assert_eq!(cipher.decrypt(&migrated).unwrap().expose_secret(), "hello");

        // The migrated envelope no longer depends on the legacy key
        let current_only = test_cipher();
        assert_eq!(current_only.decrypt(&migrated).unwrap().expose_secret(), "hello");
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let cipher = legacy_cipher();
        let migrated = cipher.migrate_legacy(FERNET_TOKEN).unwrap();
        let again = cipher.migrate_legacy(&migrated).unwrap();
        assert_eq!(migrated, again, "a v1 envelope must pass through untouched");
    }

    #[test]
    fn test_legacy_round_trip_through_test_sealer() {
        let legacy_bytes = parse_legacy_key(FERNET_KEY).unwrap();
        let legacy = LegacyKey::new(&legacy_bytes).unwrap();
        let token = legacy.seal("EAAGm0PX4ZCpsBA-facebook-ish", 1_700_000_000, &[3u8; 16]);

        let cipher = legacy_cipher();
        assert_eq!(
            cipher.decrypt(&token).unwrap().expose_secret(),
            "EAAGm0PX4ZCpsBA-facebook-ish"
        );
    }

    #[test]
    fn test_tampered_legacy_token_is_integrity_failure() {
        let mut raw = URL_SAFE.decode(FERNET_TOKEN).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x80;

        let result = legacy_cipher().decrypt(&URL_SAFE.encode(raw));
        assert!(matches!(
            result,
            Err(CastvaultError::Cipher(CipherError::Integrity(_)))
        ));
    }

    #[test]
    fn test_legacy_key_must_be_32_bytes() {
        let result = EnvelopeCipher::new(&test_master_key(), Some(&[1u8; 20][..]));
        assert!(matches!(
            result,
            Err(CastvaultError::Config(ConfigError::InvalidKey(_)))
        ));
    }
}
