use aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use serde::Deserialize;
use sha2::{Digest, Sha512};

use tessera_core::gf256;
use tessera_core::shamir::{self, ShamirShare};

#[derive(Deserialize)]
struct Vectors {
    version: String,
    sha512: Sha512Kat,
    gf256: Vec<Gf256Kat>,
    shamir: ShamirKat,
    gcm: Vec<GcmKat>,
    hkdf: HkdfCheck,
}

#[derive(Deserialize)]
struct Sha512Kat {
    message_utf8: String,
    digest_hex: String,
}

#[derive(Deserialize)]
struct Gf256Kat {
    a: u8,
    b: u8,
    product: u8,
}

#[derive(Deserialize)]
struct ShamirKat {
    secret_hex: String,
    threshold: u8,
    shares: Vec<ShareKat>,
}

#[derive(Deserialize)]
struct ShareKat {
    index: u8,
    data_hex: String,
}

#[derive(Deserialize)]
struct GcmKat {
    key_hex: String,
    iv_hex: String,
    pt_hex: String,
    aad_hex: String,
    ct_and_tag_hex: String,
}

#[derive(Deserialize)]
struct HkdfCheck {
    ikm_hex: String,
    salt_hex: String,
    info_hex: String,
}

fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tools/verify-vectors/vectors/core-v1.json".into());
    let data = std::fs::read_to_string(&path)?;
    let kat: Vectors = serde_json::from_str(&data)?;
    if kat.version != "core-v1" {
        anyhow::bail!("unknown vector file version {}", kat.version);
    }

    // SHA-512
    let digest = Sha512::digest(kat.sha512.message_utf8.as_bytes());
    if hex::encode(digest) != kat.sha512.digest_hex {
        anyhow::bail!("SHA-512 mismatch");
    }

    // GF(256) products against the published field examples
    for v in &kat.gf256 {
        let got = gf256::mul(v.a, v.b);
        if got != v.product {
            anyhow::bail!("GF(256) {:#04x}*{:#04x}: got {got:#04x}, want {:#04x}", v.a, v.b, v.product);
        }
        if v.product != 0 && gf256::div(v.product, v.b) != v.a {
            anyhow::bail!("GF(256) division does not invert {:#04x}*{:#04x}", v.a, v.b);
        }
    }

    // Shamir reconstruction from fixed shares
    let expected = hex::decode(&kat.shamir.secret_hex)?;
    let shares: Vec<ShamirShare> = kat
        .shamir
        .shares
        .iter()
        .map(|s| {
            Ok(ShamirShare {
                index: s.index,
                data: hex::decode(&s.data_hex)?,
            })
        })
        .collect::<anyhow::Result<_>>()?;
    for window in shares.windows(kat.shamir.threshold as usize) {
        let got = shamir::reconstruct(window, kat.shamir.threshold)?;
        if got != expected {
            anyhow::bail!("Shamir reconstruction mismatch from indices {:?}",
                window.iter().map(|s| s.index).collect::<Vec<_>>());
        }
    }

    // AES-256-GCM against the NIST GCM test vectors
    for v in &kat.gcm {
        let key = hex::decode(&v.key_hex)?;
        let iv = hex::decode(&v.iv_hex)?;
        let pt = hex::decode(&v.pt_hex)?;
        let aad = hex::decode(&v.aad_hex)?;
        let expected = hex::decode(&v.ct_and_tag_hex)?;
        let cipher = Aes256Gcm::new_from_slice(&key)?;
        let got = cipher
            .encrypt(Nonce::from_slice(&iv), Payload { msg: &pt, aad: &aad })
            .map_err(|_| anyhow::anyhow!("gcm seal"))?;
        if got != expected {
            anyhow::bail!("AES-256-GCM mismatch for key {}", v.key_hex);
        }
    }

    // HKDF-SHA-512: determinism and expand-prefix consistency
    let ikm = hex::decode(&kat.hkdf.ikm_hex)?;
    let salt = hex::decode(&kat.hkdf.salt_hex)?;
    let info = hex::decode(&kat.hkdf.info_hex)?;
    let hk = hkdf::Hkdf::<Sha512>::new(Some(&salt), &ikm);
    let mut long = [0u8; 96];
    let mut short = [0u8; 32];
    hk.expand(&info, &mut long).expect("expand 96");
    hk.expand(&info, &mut short).expect("expand 32");
    if long[..32] != short {
        anyhow::bail!("HKDF expand is not prefix-consistent");
    }

    println!("Vectors OK");
    Ok(())
}
