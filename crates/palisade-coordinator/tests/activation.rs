//! Activation protocol tests
//!
//! First activation, quota enforcement, attestation gating, idempotent
//! retries, security-version updates, and serial monotonicity, driven
//! through the core exactly as the marble surface drives it.

mod common;

use common::*;
use palisade_core::CoreError;
use std::time::Instant;
use tempfile::TempDir;
use uuid::Uuid;

#[test]
fn first_activation_returns_templated_secret_and_second_hits_quota() {
    let dir = TempDir::new().unwrap();
    let tc = start_coordinator(dir.path(), [1; 32]);
    tc.core.set_manifest(&single_marble_manifest()).unwrap();

    let (_, csr) = make_csr();
    register_quote(&tc.validator, b"quote-1", &csr, backend_package(2));

    let response = tc
        .core
        .activate(activation(b"quote-1", &csr, Uuid::new_v4(), "backend-first"))
        .unwrap();

    // the 32-byte shared secret renders as 64 hex chars
    let api_key = &response.parameters.env["API_KEY"];
    assert_eq!(api_key.len(), 64);
    assert!(api_key.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(response.parameters.argv, vec!["--serve"]);
    assert!(response.certificate.contains("BEGIN CERTIFICATE"));
    assert!(response.root_cert.contains("BEGIN CERTIFICATE"));

    // MaxActivations = 1: a second marble instance is turned away
    let (_, csr2) = make_csr();
    register_quote(&tc.validator, b"quote-2", &csr2, backend_package(2));
    let err = tc
        .core
        .activate(activation(b"quote-2", &csr2, Uuid::new_v4(), "backend-first"))
        .unwrap_err();
    assert!(matches!(err, CoreError::ResourceExhausted(_)));
}

#[test]
fn rejected_quote_leaves_activation_table_unchanged() {
    let dir = TempDir::new().unwrap();
    let tc = start_coordinator(dir.path(), [1; 32]);
    tc.core.set_manifest(&single_marble_manifest()).unwrap();

    let (_, csr) = make_csr();
    // quote never registered with the validator
    let err = tc
        .core
        .activate(activation(b"bogus", &csr, Uuid::new_v4(), "backend-first"))
        .unwrap_err();
    assert!(matches!(err, CoreError::PermissionDenied(_)));

    // the failed attempt consumed no quota: a valid activation still fits
    register_quote(&tc.validator, b"quote-1", &csr, backend_package(2));
    tc.core
        .activate(activation(b"quote-1", &csr, Uuid::new_v4(), "backend-first"))
        .unwrap();
}

#[test]
fn unknown_marble_and_wrong_state_are_permission_denied() {
    let dir = TempDir::new().unwrap();
    let tc = start_coordinator(dir.path(), [1; 32]);

    let (_, csr) = make_csr();
    register_quote(&tc.validator, b"quote-1", &csr, backend_package(2));

    // no manifest yet: the state machine rejects before anything else
    let err = tc
        .core
        .activate(activation(b"quote-1", &csr, Uuid::new_v4(), "backend-first"))
        .unwrap_err();
    assert!(matches!(err, CoreError::PermissionDenied(_)));

    tc.core.set_manifest(&single_marble_manifest()).unwrap();
    let err = tc
        .core
        .activate(activation(b"quote-1", &csr, Uuid::new_v4(), "ghost"))
        .unwrap_err();
    assert!(matches!(err, CoreError::PermissionDenied(_)));
}

#[test]
fn activation_is_idempotent_for_same_uuid_and_key() {
    let dir = TempDir::new().unwrap();
    let tc = start_coordinator(dir.path(), [1; 32]);
    tc.core.set_manifest(&single_marble_manifest()).unwrap();

    let (_, csr) = make_csr();
    register_quote(&tc.validator, b"quote-1", &csr, backend_package(2));
    let uuid = Uuid::new_v4();

    let first = tc
        .core
        .activate(activation(b"quote-1", &csr, uuid, "backend-first"))
        .unwrap();
    let retry = tc
        .core
        .activate(activation(b"quote-1", &csr, uuid, "backend-first"))
        .unwrap();

    assert_eq!(first.certificate, retry.certificate);
    assert_eq!(first.parameters, retry.parameters);
}

#[test]
fn uuid_reuse_with_different_key_is_rejected() {
    let dir = TempDir::new().unwrap();
    let tc = start_coordinator(dir.path(), [1; 32]);
    tc.core.set_manifest(&single_marble_manifest()).unwrap();

    let (_, csr) = make_csr();
    register_quote(&tc.validator, b"quote-1", &csr, backend_package(2));
    let uuid = Uuid::new_v4();
    tc.core
        .activate(activation(b"quote-1", &csr, uuid, "backend-first"))
        .unwrap();

    let (_, other_csr) = make_csr();
    register_quote(&tc.validator, b"quote-2", &other_csr, backend_package(2));
    let err = tc
        .core
        .activate(activation(b"quote-2", &other_csr, uuid, "backend-first"))
        .unwrap_err();
    assert!(matches!(err, CoreError::PermissionDenied(_)));
}

#[test]
fn serials_increase_across_issued_certificates() {
    let dir = TempDir::new().unwrap();
    let tc = start_coordinator(dir.path(), [1; 32]);

    let manifest = serde_json::json!({
        "Packages": {
            "backend": { "SignerID": "c0ffee", "ProductID": 13, "SecurityVersion": 2 }
        },
        "Marbles": {
            "backend": { "Package": "backend", "MaxActivations": 0, "Parameters": {} }
        }
    })
    .to_string()
    .into_bytes();
    tc.core.set_manifest(&manifest).unwrap();

    let mut last_serial = 0;
    for i in 0..3 {
        let (_, csr) = make_csr();
        let quote = format!("quote-{i}").into_bytes();
        register_quote(&tc.validator, &quote, &csr, backend_package(2));
        let response = tc
            .core
            .activate(activation(&quote, &csr, Uuid::new_v4(), "backend"))
            .unwrap();
        let serial = cert_serial(&response.certificate);
        assert!(serial > last_serial, "serial {serial} not above {last_serial}");
        last_serial = serial;
    }
}

#[test]
fn raised_security_version_gates_future_activations() {
    let dir = TempDir::new().unwrap();
    let tc = start_coordinator(dir.path(), [1; 32]);

    let (admin_pem, admin_der) = operator_cert("admin");
    let manifest = serde_json::json!({
        "Packages": {
            "backend": { "SignerID": "c0ffee", "ProductID": 13, "SecurityVersion": 2 }
        },
        "Marbles": {
            "backend": { "Package": "backend", "MaxActivations": 0, "Parameters": {} }
        },
        "Roles": {
            "updater": {
                "ResourceType": "Packages",
                "ResourceNames": ["backend"],
                "Actions": ["UpdateSecurityVersion"]
            }
        },
        "Users": {
            "admin": { "Certificate": admin_pem, "Roles": ["updater"] }
        }
    })
    .to_string()
    .into_bytes();
    tc.core.set_manifest(&manifest).unwrap();

    // an enclave at security version 2 activates fine before the update
    let (_, old_csr) = make_csr();
    register_quote(&tc.validator, b"old-quote", &old_csr, backend_package(2));
    tc.core
        .activate(activation(b"old-quote", &old_csr, Uuid::new_v4(), "backend"))
        .unwrap();

    let delta = serde_json::json!({
        "Packages": { "backend": { "SecurityVersion": 3 } }
    })
    .to_string()
    .into_bytes();
    let generation = tc
        .core
        .update_manifest(&delta, &[admin_der.clone()])
        .unwrap();
    assert_eq!(generation, 2);

    // same enclave class is now below the floor
    let (_, stale_csr) = make_csr();
    register_quote(&tc.validator, b"stale-quote", &stale_csr, backend_package(2));
    let err = tc
        .core
        .activate(activation(b"stale-quote", &stale_csr, Uuid::new_v4(), "backend"))
        .unwrap_err();
    assert!(matches!(err, CoreError::PermissionDenied(_)));

    // a patched enclave at version 3 is admitted
    let (_, patched_csr) = make_csr();
    register_quote(&tc.validator, b"patched-quote", &patched_csr, backend_package(3));
    tc.core
        .activate(activation(b"patched-quote", &patched_csr, Uuid::new_v4(), "backend"))
        .unwrap();
}

#[test]
fn update_requires_an_authorized_signer() {
    let dir = TempDir::new().unwrap();
    let tc = start_coordinator(dir.path(), [1; 32]);

    let (admin_pem, _) = operator_cert("admin");
    let manifest = serde_json::json!({
        "Packages": {
            "backend": { "SignerID": "c0ffee", "ProductID": 13, "SecurityVersion": 2 }
        },
        "Marbles": {
            "backend": { "Package": "backend", "MaxActivations": 0, "Parameters": {} }
        },
        "Roles": {
            "updater": {
                "ResourceType": "Packages",
                "ResourceNames": ["backend"],
                "Actions": ["UpdateSecurityVersion"]
            }
        },
        "Users": {
            "admin": { "Certificate": admin_pem, "Roles": ["updater"] }
        }
    })
    .to_string()
    .into_bytes();
    tc.core.set_manifest(&manifest).unwrap();

    let delta = serde_json::json!({
        "Packages": { "backend": { "SecurityVersion": 3 } }
    })
    .to_string()
    .into_bytes();

    // unauthenticated
    let err = tc.core.update_manifest(&delta, &[]).unwrap_err();
    assert!(matches!(err, CoreError::PermissionDenied(_)));

    // authenticated as nobody the manifest knows
    let (_, stranger_der) = operator_cert("stranger");
    let err = tc.core.update_manifest(&delta, &[stranger_der]).unwrap_err();
    assert!(matches!(err, CoreError::PermissionDenied(_)));
}

#[test]
fn expired_deadline_aborts_before_commit() {
    let dir = TempDir::new().unwrap();
    let tc = start_coordinator(dir.path(), [1; 32]);
    tc.core.set_manifest(&single_marble_manifest()).unwrap();

    let (_, csr) = make_csr();
    register_quote(&tc.validator, b"quote-1", &csr, backend_package(2));

    let mut request = activation(b"quote-1", &csr, Uuid::new_v4(), "backend-first");
    request.deadline = Some(Instant::now());
    let err = tc.core.activate(request).unwrap_err();
    assert!(matches!(err, CoreError::DeadlineExceeded));

    // nothing was recorded: the quota is still available
    tc.core
        .activate(activation(b"quote-1", &csr, Uuid::new_v4(), "backend-first"))
        .unwrap();
}
