//! Operational commands: rotate, migrate, verify, authorize.
//!
//! Each command returns an [`OperationReport`] instead of an error so the
//! binary can always print something useful and pick the exit status from
//! [`Outcome`].

mod report;


pub use report::{OperationReport, Outcome};

use crate::config::{ENV_CURRENT_KEY, ENV_CURRENT_PASSPHRASE, ENV_NEXT_KEY, ENV_NEXT_PASSPHRASE};
use crate::context::CredentialContext;
use crate::issuer::TokenIssuer;
use crate::lifecycle::LifecycleError;
use crate::store::{EnvelopeSummary, MigrationOutcome, StoreError};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// Re-encrypts the stored credential under `to` and makes it current.
pub fn rotate_key(ctx: &CredentialContext, to: &str) -> OperationReport {
    let mut report = OperationReport::new("rotate");
    report.detail("toVersion", to);

    match ctx.store().rotate(to) {
        Ok(outcome) => {
            report
                .detail("fromVersion", outcome.from_version.as_str())
                .detail("reencrypted", outcome.reencrypted);
            if !outcome.reencrypted {
                report.note(format!("credential was already sealed with '{to}'"));
            }
            if ctx.config().keys.current_version != to {
                let from = ctx.config().keys.current_version.as_str();
                report.note(format!(
                    "set keys.current_version = \"{to}\" and keys.next_version = \"{from}\""
                ));
                report.note(format!(
                    "swap the key material too: {ENV_CURRENT_KEY} (or {ENV_CURRENT_PASSPHRASE}) must now hold the '{to}' key \
                     and {ENV_NEXT_KEY} (or {ENV_NEXT_PASSPHRASE}) the '{from}' key; otherwise the next start \
                     promotes '{from}' again"
                ));
            }
        }
        Err(e) => {
            store_failure(&mut report, &e);
            report.note("the credential file and current key version are unchanged");
        }
    }

    log_report(&report);
    report
}

/// Converts a legacy credential file to the current envelope format.
pub fn migrate_legacy(ctx: &CredentialContext) -> OperationReport {
    let mut report = OperationReport::new("migrate");
    report.detail("path", ctx.store().path().display().to_string());

    match ctx.store().migrate_legacy() {
        Ok(MigrationOutcome::AlreadyCurrent { key_version }) => {
            report
                .detail("keyVersion", key_version)
                .note("credential file already uses the current format");
        }
        Ok(MigrationOutcome::Migrated {
            backup_path,
            legacy_key_version,
            key_version,
        }) => {
            report
                .detail("backupPath", backup_path.display().to_string())
                .detail("legacyKeyVersion", legacy_key_version)
                .detail("keyVersion", key_version)
                .note("remove the backup once the service has started cleanly");
        }
        Err(StoreError::NotFound(_)) => {
            report.degrade("no credential file to migrate; run `tokenkeep authorize`");
        }
        Err(e) => {
            store_failure(&mut report, &e);
            report.note("the credential file and any backup were left in place");
        }
    }

    log_report(&report);
    report
}

/// Checks that the stored credential decrypts and reports its metadata.
///
/// Degraded when the envelope uses a key that is not current or the access
/// token has expired. Fatal when the credential is absent, legacy, or
/// cannot be decrypted.
pub fn verify(ctx: &CredentialContext) -> OperationReport {
    let mut report = OperationReport::new("verify");
    let store = ctx.store();
    report.detail("path", store.path().display().to_string());

    let summary = match store.inspect() {
        Ok(Some(EnvelopeSummary::Current {
            format_version,
            algorithm,
            key_version_id,
            created_at,
        })) => {
            report
                .detail("formatVersion", format_version)
                .detail("algorithm", algorithm)
                .detail("keyVersion", key_version_id.as_str())
                .detail("sealedAt", created_at.to_rfc3339());
            key_version_id
        }
        Ok(Some(EnvelopeSummary::Legacy)) => {
            report
                .detail("formatVersion", 1)
                .fail("legacy credential format; run `tokenkeep migrate`");
            log_report(&report);
            return report;
        }
        Ok(None) => {
            report.fail("no stored credential; run `tokenkeep authorize`");
            log_report(&report);
            return report;
        }
        Err(e) => {
            store_failure(&mut report, &e);
            log_report(&report);
            return report;
        }
    };

    let credential = match store.load() {
        Ok(Some(credential)) => credential,
        Ok(None) => {
            report.fail("credential file disappeared during verification");
            log_report(&report);
            return report;
        }
        Err(e) => {
            store_failure(&mut report, &e);
            log_report(&report);
            return report;
        }
    };

    let now = Utc::now();
    report
        .detail("expiresAt", credential.expires_at.to_rfc3339())
        .detail("tokenType", credential.token_type.as_str());
    if !credential.scope.is_empty() {
        report.detail("scope", credential.scope.as_str());
    }

    match store.registry().current_version() {
        Some(current) if current != summary => {
            report.degrade(format!(
                "sealed with key '{summary}' but current key is '{current}'; run `tokenkeep rotate --to {current}`"
            ));
        }
        _ => {}
    }

    if credential.is_expired_at(now) {
        report.degrade("access token has expired; it will be refreshed on next use");
    } else if credential.expires_within(ctx.config().lifecycle.refresh_window(), now) {
        report.note("access token is inside the refresh window");
    }

    log_report(&report);
    report
}

/// Runs the issuer's authorization flow and stores the resulting credential.
pub async fn authorize(ctx: &CredentialContext, issuer: Arc<dyn TokenIssuer>) -> OperationReport {
    let mut report = OperationReport::new("authorize");
    let manager = ctx.lifecycle(issuer);

    match manager.authorize().await {
        Ok(()) => {
            if let Some(expires_at) = manager.expires_at() {
                report.detail("expiresAt", expires_at.to_rfc3339());
            }
            if let Some(version) = ctx.registry().current_version() {
                report.detail("keyVersion", version);
            }
            report.detail("state", manager.state().as_str());
        }
        Err(LifecycleError::Store(e)) => {
            store_failure(&mut report, &e);
            match &*e {
                StoreError::LegacyFormatDetected => {
                    report.note("run `tokenkeep migrate` before authorizing; the legacy file was left in place");
                }
                StoreError::Decryption(_)
                | StoreError::UnsupportedFormatVersion(_)
                | StoreError::IncompleteCredential(_) => {
                    report.note("the unreadable credential file was left in place; move it aside to re-authorize");
                }
                _ => {}
            }
        }
        Err(e) => {
            report.fail(e.to_string());
        }
    }

    log_report(&report);
    report
}

fn store_failure(report: &mut OperationReport, error: &StoreError) {
    report.detail("errorClass", error.class()).fail(error.to_string());
}

fn log_report(report: &OperationReport) {
    match report.outcome {
        Outcome::Success => info!(operation = report.operation, "Operation succeeded"),
        outcome => warn!(
            operation = report.operation,
            outcome = outcome.as_str(),
            messages = ?report.messages,
            "Operation did not fully succeed"
        ),
    }
}
