// Copyright (c) Mesh Contributors
// SPDX-License-Identifier: Apache-2.0

//! Persisted machine identity.
//!
//! The identity file is a small text blob holding the base64 private key and
//! an optional human label. It is written exactly once per machine and
//! re-read on every start; losing it means the machine joins the mesh as a
//! new participant.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use tracing::info;
use zeroize::Zeroizing;

use crate::{KeyDecodeError, MachineKeyPair, KEY_LENGTH};

const IDENTITY_FILE: &str = "identity";

/// A machine's identity as loaded from (or persisted to) the data directory.
pub struct MachineIdentity {
    pub keypair: MachineKeyPair,
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity io: {0}")]
    Io(#[from] std::io::Error),
    #[error("identity file is malformed: {0}")]
    Malformed(String),
    #[error(transparent)]
    Key(#[from] KeyDecodeError),
}

impl MachineIdentity {
    /// Loads the identity from `data_dir`, generating and persisting a fresh
    /// one when no identity file exists yet. The file is created with mode
    /// 0600 under a 0700 directory.
    pub fn load_or_generate(data_dir: &Path, name: &str) -> Result<Self, IdentityError> {
        let path = identity_path(data_dir);
        if path.exists() {
            return Self::load(&path);
        }

        let keypair = MachineKeyPair::generate(&mut rand::thread_rng());
        let identity = Self {
            keypair,
            name: name.to_string(),
        };
        identity.persist(data_dir)?;
        info!(
            machine = %identity.keypair.public(),
            path = %path.display(),
            "generated new machine identity"
        );
        Ok(identity)
    }

    fn load(path: &Path) -> Result<Self, IdentityError> {
        let blob = Zeroizing::new(fs::read_to_string(path)?);
        let mut private_key = None;
        let mut name = String::new();
        for line in blob.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| IdentityError::Malformed(format!("bad line: {line}")))?;
            match key.trim() {
                "private_key" => private_key = Some(value.trim().to_string()),
                "name" => name = value.trim().to_string(),
                other => {
                    return Err(IdentityError::Malformed(format!("unknown field: {other}")));
                }
            }
        }
        let encoded = private_key
            .ok_or_else(|| IdentityError::Malformed("missing private_key".to_string()))?;
        let bytes = decode_private_key(&encoded)?;
        Ok(Self {
            keypair: MachineKeyPair::from_bytes(*bytes),
            name,
        })
    }

    fn persist(&self, data_dir: &Path) -> Result<(), IdentityError> {
        fs::create_dir_all(data_dir)?;
        let path = identity_path(data_dir);
        let blob = Zeroizing::new(format!(
            "private_key = {}\nname = {}\n",
            self.keypair.private_key_base64(),
            self.name,
        ));

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::{OpenOptionsExt as _, PermissionsExt as _};
            fs::set_permissions(data_dir, fs::Permissions::from_mode(0o700))?;
            options.mode(0o600);
        }
        let mut file = options.open(&path)?;
        file.write_all(blob.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

fn identity_path(data_dir: &Path) -> PathBuf {
    data_dir.join(IDENTITY_FILE)
}

fn decode_private_key(encoded: &str) -> Result<Zeroizing<[u8; KEY_LENGTH]>, IdentityError> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    let bytes = Zeroizing::new(
        STANDARD
            .decode(encoded)
            .map_err(|e| IdentityError::Malformed(e.to_string()))?,
    );
    let bytes: [u8; KEY_LENGTH] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| KeyDecodeError::WrongLength(bytes.len()))?;
    Ok(Zeroizing::new(bytes))
}
