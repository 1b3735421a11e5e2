//! Operator CLI over the Tessera core: an in-process lifecycle walkthrough
//! plus Shamir share utilities for key custody drills.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use tessera_core::anchor::MemoryAnchorSink;
use tessera_core::audit::MemoryAuditSink;
use tessera_core::authz::{AccessGrant, AccessLevel, GrantTableProvider};
use tessera_core::model::{
    ApprovedAssignment, AuthzProviderKind, DocumentRecord, DocumentStatus, SecurityProfile,
    StorageTier,
};
use tessera_core::store::MemoryStore;
use tessera_core::{shamir, CoreContext, SoftHsm, Tessera};

#[derive(Parser)]
#[command(name = "tessera", version, about = "Multi-tier document confidentiality toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Walk a document through deconstruct, reconstruct, rotate and destroy
    /// against an in-process stack.
    Demo {
        /// Shamir threshold for the demo tenant
        #[arg(long, default_value_t = 2)]
        threshold: u8,
        /// Total Shamir shares for the demo tenant
        #[arg(long, default_value_t = 3)]
        shares: u8,
        /// Redaction marker width
        #[arg(long, default_value_t = 3)]
        marker_width: u8,
    },
    /// Split a secret file into Shamir shares (printed as base64).
    Split {
        /// File holding the secret bytes
        file: PathBuf,
        #[arg(long, short = 'm')]
        threshold: u8,
        #[arg(long, short = 'n')]
        shares: u8,
    },
    /// Recombine base64 shares of the form INDEX:BASE64.
    Combine {
        #[arg(long, short = 'm')]
        threshold: u8,
        /// Shares, e.g. 1:qj3k... 3:88aa...
        shares: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match Cli::parse().command {
        Command::Demo {
            threshold,
            shares,
            marker_width,
        } => demo(threshold, shares, marker_width).await,
        Command::Split {
            file,
            threshold,
            shares,
        } => split(&file, threshold, shares),
        Command::Combine { threshold, shares } => combine(threshold, &shares),
    }
}

async fn demo(threshold: u8, total_shares: u8, marker_width: u8) -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let hsm = Arc::new(SoftHsm::new());
    let authz = Arc::new(GrantTableProvider::new(store.clone()));
    let audit = Arc::new(MemoryAuditSink::new());
    let anchor = Arc::new(MemoryAnchorSink::new());
    let tessera = Tessera::new(CoreContext::new(
        store.clone(),
        hsm.clone(),
        authz.clone(),
        audit.clone(),
        anchor.clone(),
    ));

    let organization_id = Uuid::new_v4();
    let document_id = Uuid::new_v4();
    let session_id = Uuid::new_v4();
    let viewer_id = Uuid::new_v4();
    let now = Utc::now();

    store.insert_document(DocumentRecord {
        id: document_id,
        organization_id,
        status: DocumentStatus::Approved,
        previous_version_id: None,
        legal_hold: false,
        effective_retention_until: None,
        created_at: now,
        updated_at: now,
    });
    store.put_security_profile(SecurityProfile {
        organization_id,
        shamir_threshold: threshold,
        shamir_total_shares: total_shares,
        storage_tier: StorageTier::Tier1,
        marker_width,
        export_permitted: true,
        min_retention_days: 0,
        share_holder_ids: (1..=total_shares).map(|i| format!("holder-{i}")).collect(),
        authz_provider: AuthzProviderKind::Conventional,
    });
    store.put_approved_assignments(
        document_id,
        session_id,
        vec![
            assignment("CS-PUBLIC", "block-1", "Public statement."),
            assignment("CS-CONFIDENTIAL", "block-2", "Budget $4.2M."),
            assignment("CS-SECRET", "block-3", "Agent Smith."),
        ],
    );

    let outcome = tessera.deconstruct(document_id, session_id).await?;
    println!(
        "deconstructed: {} markers, sets {:?}, base hash {}..",
        outcome.marker_count,
        outcome.content_sets,
        &outcome.base_hash[..16]
    );

    for sets in [
        vec!["CS-PUBLIC"],
        vec!["CS-PUBLIC", "CS-CONFIDENTIAL"],
        vec!["CS-PUBLIC", "CS-CONFIDENTIAL", "CS-SECRET"],
    ] {
        let level_id = Uuid::new_v4();
        authz.put_level(AccessLevel {
            id: level_id,
            organization_id,
            active: true,
            content_set_identifiers: sets.iter().map(|s| s.to_string()).collect(),
        });
        authz.put_grant(AccessGrant {
            user_id: viewer_id,
            document_id,
            access_level_id: level_id,
            organization_id,
            revoked: false,
            expires_at: None,
        });
        let view = tessera
            .reconstruct(document_id, viewer_id, level_id, organization_id)
            .await?;
        let rendered: Vec<&str> = view.blocks.iter().map(|b| b.content.as_str()).collect();
        println!("view {:?}: {}", sets, rendered.join(" "));
    }

    let rotation = tessera.rotate_keys(document_id).await?;
    println!("rotated {} content-set keys", rotation.rotated.len());

    let report = tessera.verify_integrity(document_id).await?;
    println!(
        "integrity: base {} / {} sets verified",
        report.base_document_ok,
        report.sets.iter().filter(|x| x.ciphertext_ok).count()
    );

    let destruction = tessera.destroy(document_id, "demo teardown", true).await?;
    println!(
        "destroyed {} content sets, {} hsm keys",
        destruction.destroyed_content_sets.len(),
        destruction.destroyed_key_handles
    );
    println!("audit events: {}", audit.events().len());
    hsm.teardown();
    Ok(())
}

fn assignment(set: &str, block: &str, text: &str) -> ApprovedAssignment {
    ApprovedAssignment {
        content_set_identifier: set.to_string(),
        block_id: block.to_string(),
        start_offset: None,
        end_offset: None,
        selected_text: Some(text.to_string()),
        page_number: 1,
    }
}

fn split(file: &PathBuf, threshold: u8, total: u8) -> anyhow::Result<()> {
    let secret = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let shares = shamir::split(&secret, threshold, total)?;
    for share in &shares {
        println!(
            "{}:{}",
            share.index,
            general_purpose::STANDARD.encode(&share.data)
        );
    }
    eprintln!("any {threshold} of {total} shares recover the secret");
    Ok(())
}

fn combine(threshold: u8, encoded: &[String]) -> anyhow::Result<()> {
    let mut shares = Vec::with_capacity(encoded.len());
    for raw in encoded {
        let (index, data) = raw
            .split_once(':')
            .with_context(|| format!("share '{raw}' is not INDEX:BASE64"))?;
        let index: u8 = index.parse().context("share index")?;
        let data = general_purpose::STANDARD
            .decode(data)
            .context("share payload base64")?;
        shares.push(shamir::ShamirShare { index, data });
    }
    if shares.len() < threshold as usize {
        bail!("{} shares supplied, threshold is {threshold}", shares.len());
    }
    let secret = shamir::reconstruct(&shares, threshold)?;
    println!("{}", general_purpose::STANDARD.encode(secret));
    Ok(())
}
