//! Determinism, metamorphism, stub size and the reference scenarios.

use sgn_engine::{emulator, Architecture, ConfigurationError, Encoder, SgnError};

#[test]
fn test_plain_output_is_reproducible() {
    let payload: Vec<u8> = (0..=255).collect();
    for architecture in Architecture::ALL {
        let first = Encoder::new(architecture, 0x5A, true, 3, false).unwrap();
        let second = Encoder::new(architecture, 0x5A, true, 3, false).unwrap();
        assert_eq!(first.encode(&payload).unwrap(), second.encode(&payload).unwrap());
    }
}

#[test]
fn test_metamorphic_output_is_reproducible() {
    let payload = b"deterministic per seed";
    for architecture in Architecture::ALL {
        let first = Encoder::new(architecture, 0xC3, false, 4, true).unwrap();
        let second = Encoder::new(architecture, 0xC3, false, 4, true).unwrap();
        assert_eq!(first.encode(payload).unwrap(), second.encode(payload).unwrap());
    }
}

#[test]
fn test_different_seeds_give_different_stubs() {
    let payload = b"same payload, different seeds";
    for architecture in Architecture::ALL {
        let a = Encoder::new(architecture, 1, false, 2, false).unwrap().encode(payload).unwrap();
        let b = Encoder::new(architecture, 2, false, 2, false).unwrap().encode(payload).unwrap();
        assert_ne!(a.stub(), b.stub());
        assert_ne!(a.as_bytes(), b.as_bytes());
        emulator::verify(architecture, &a, payload).unwrap();
        emulator::verify(architecture, &b, payload).unwrap();
    }
}

#[test]
fn test_plain_mode_never_inserts_junk() {
    for architecture in Architecture::ALL {
        for seed in [3u8, 200] {
            let (_, stats) = Encoder::new(architecture, seed, true, 2, false)
                .unwrap()
                .encode_with_stats(b"abc")
                .unwrap();
            assert_eq!(stats.junk_items, 0);
        }
    }
}

#[test]
fn test_stub_grows_with_pass_count() {
    let payload = [0xABu8; 64];
    for architecture in Architecture::ALL {
        for plain in [true, false] {
            for save in [false, true] {
                let mut previous = 0;
                for passes in 1..=6 {
                    let stub_len = Encoder::new(architecture, 0x33, plain, passes, save)
                        .unwrap()
                        .encode(&payload)
                        .unwrap()
                        .stub_len();
                    assert!(
                        stub_len > previous,
                        "{architecture} plain={plain} save={save}: {passes} passes gave {stub_len} <= {previous}"
                    );
                    previous = stub_len;
                }
            }
        }
    }
}

#[test]
fn test_x64_reference_scenario() {
    let encoder = Encoder::x64(0x42, true, 1, false).unwrap();
    let payload = [0x90, 0x90, 0xC3];
    let buffer = encoder.encode(&payload).unwrap();

    // mov ecx, 3 ; mov al, 0x42 ; lea rsi, [rip+0xb] ; 11-byte decode loop
    assert_eq!(buffer.stub_len(), 28);
    assert_eq!(
        &buffer.stub()[..14],
        &[0xB9, 0x03, 0x00, 0x00, 0x00, 0xB0, 0x42, 0x48, 0x8D, 0x35, 0x0B, 0x00, 0x00, 0x00]
    );
    assert_eq!(buffer.encoded_payload().len(), 3);

    let outcome = emulator::verify(Architecture::X64, &buffer, &payload).unwrap();
    assert_eq!(outcome.payload, payload);
}

#[test]
fn test_empty_payload_scenario() {
    for architecture in Architecture::ALL {
        let buffer = Encoder::new(architecture, 7, false, 2, true).unwrap().encode(&[]).unwrap();
        assert!(buffer.encoded_payload().is_empty());
        assert_eq!(buffer.len(), buffer.stub_len());
        let outcome = emulator::verify(architecture, &buffer, &[]).unwrap();
        assert!(outcome.registers_preserved);
    }
}

#[test]
fn test_zero_encoding_count_scenario() {
    for architecture in Architecture::ALL {
        assert_eq!(
            Encoder::new(architecture, 0, false, 0, false),
            Err(ConfigurationError::ZeroEncodingCount)
        );
    }
}

#[test]
fn test_errors_convert_into_umbrella() {
    let err: SgnError = ConfigurationError::ZeroEncodingCount.into();
    assert!(matches!(err, SgnError::Configuration(ConfigurationError::ZeroEncodingCount)));
}

#[test]
fn test_encoder_shared_across_threads() {
    let encoder = std::sync::Arc::new(Encoder::x64(9, false, 3, true).unwrap());
    let expected = encoder.encode(b"threads").unwrap();
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let encoder = encoder.clone();
            std::thread::spawn(move || encoder.encode(b"threads").unwrap())
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), expected);
    }
}
