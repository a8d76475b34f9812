use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::{
    db::ActivityStore,
    error::{AppError, AppResult},
    models::{ActivityInfo, Device, DeviceProof},
    services::{
        keys::{generate_activity_keypair, random_hex, sha256_hex},
        providers::IdentityBridge,
    },
};

const DEVICE_KEY_BYTES: usize = 32;
const USER_ID_BYTES: usize = 16;

/// Everything a client takes away from device registration: the sealed
/// device proof it must present on authenticated requests, and the
/// account's activity info (whose `info_message` carries the sealed
/// activity private key).
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRegistration {
    pub proof_memo: String,
    pub activity_info: ActivityInfo,
}

/// Device registration and proof verification.
///
/// A device never gets a session: each registration hands out a random
/// device key sealed to the account's memo key, and every later request
/// proves possession by returning that memo. Only the hash of the device
/// key is stored server-side.
#[derive(Clone)]
pub struct AccountService {
    store: Arc<dyn ActivityStore>,
    bridge: Arc<dyn IdentityBridge>,
    device_limit: i64,
    registration_cooldown: Duration,
}

impl AccountService {
    pub fn new(
        store: Arc<dyn ActivityStore>,
        bridge: Arc<dyn IdentityBridge>,
        device_limit: i64,
        registration_cooldown_secs: i64,
    ) -> Self {
        Self {
            store,
            bridge,
            device_limit,
            registration_cooldown: Duration::seconds(registration_cooldown_secs),
        }
    }

    /// Registers a new device for `username`.
    ///
    /// The account must exist on chain; registrations are rate limited per
    /// account and capped at a per-account device quota. Activity info is
    /// created on first registration and reused afterwards.
    pub async fn register_device(
        &self,
        username: &str,
        device_name: Option<String>,
    ) -> AppResult<DeviceRegistration> {
        let account = self
            .bridge
            .lookup_account(username)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("unknown account: {username}")))?;

        let now = Utc::now();
        let cooldown_start = now - self.registration_cooldown;
        if self
            .store
            .device_registered_since(username, cooldown_start)
            .await?
        {
            return Err(AppError::RateLimited(
                "a device was registered for this account too recently".to_string(),
            ));
        }

        if self.store.device_count(username).await? >= self.device_limit {
            return Err(AppError::QuotaExceeded(
                "device limit reached for this account".to_string(),
            ));
        }

        let device_key = random_hex(DEVICE_KEY_BYTES);
        let proof = DeviceProof {
            device_key: device_key.clone(),
            created_at: now,
        };
        let proof_json = serde_json::to_string(&proof)
            .map_err(|e| AppError::Internal(format!("device proof encoding failed: {e}")))?;
        let proof_memo = self.bridge.seal_memo(&account.memo_key, &proof_json).await?;

        let device = Device {
            username: username.to_string(),
            device_name,
            device_key_hash: sha256_hex(&device_key),
            memo_key: account.memo_key.clone(),
            created_at: now,
        };
        self.store.insert_device(&device).await?;

        let activity_info = self
            .get_or_create_activity_info(username, &account.memo_key)
            .await?;

        info!(username, "device registered");

        Ok(DeviceRegistration {
            proof_memo,
            activity_info,
        })
    }

    /// Verifies a device proof memo and returns the matching device.
    ///
    /// With `max_proof_age` set, proofs older than the window are rejected
    /// even when the device is otherwise valid. Every failure collapses to
    /// the same authentication error.
    pub async fn verify_device(
        &self,
        username: &str,
        proof_memo: &str,
        max_proof_age: Option<Duration>,
    ) -> AppResult<Device> {
        let auth_failed = || AppError::Auth("device verification failed".to_string());

        let decoded = self
            .bridge
            .open_memo(username, proof_memo)
            .await?
            .ok_or_else(auth_failed)?;
        let proof: DeviceProof = serde_json::from_str(&decoded).map_err(|_| auth_failed())?;

        if let Some(max_age) = max_proof_age {
            if Utc::now() - proof.created_at > max_age {
                return Err(auth_failed());
            }
        }

        self.store
            .find_device(username, &sha256_hex(&proof.device_key))
            .await?
            .ok_or_else(auth_failed)
    }

    /// Loads the account's activity info and checks that the presented
    /// `user_id` belongs to it. Used by the activity routes after device
    /// verification.
    pub async fn activity_identity(&self, username: &str, user_id: &str) -> AppResult<ActivityInfo> {
        let info = self
            .store
            .find_activity_info(&sha256_hex(username))
            .await?
            .ok_or_else(|| AppError::Auth("no activity info for this account".to_string()))?;

        if sha256_hex(user_id) != info.hashed_user_id {
            return Err(AppError::Auth("activity identity mismatch".to_string()));
        }
        Ok(info)
    }

    /// Returns the existing activity info for `username`, creating it on
    /// first registration. A lost creation race falls back to the row the
    /// winner inserted.
    async fn get_or_create_activity_info(
        &self,
        username: &str,
        memo_key: &str,
    ) -> AppResult<ActivityInfo> {
        let hashed_username = sha256_hex(username);
        if let Some(info) = self.store.find_activity_info(&hashed_username).await? {
            return Ok(info);
        }

        // Key generation takes hundreds of milliseconds; keep it off the
        // async workers.
        let keypair = tokio::task::spawn_blocking(generate_activity_keypair)
            .await
            .map_err(|e| AppError::Internal(format!("keygen task failed: {e}")))??;

        let user_id = random_hex(USER_ID_BYTES);
        let info_payload = json!({
            "user_id": user_id,
            "public_activity_key": keypair.public_pem,
            "private_activity_key": keypair.private_pem,
        })
        .to_string();
        let info_message = self.bridge.seal_memo(memo_key, &info_payload).await?;

        let info = ActivityInfo {
            hashed_username: hashed_username.clone(),
            hashed_user_id: sha256_hex(&user_id),
            public_activity_key: keypair.public_pem,
            info_message,
            memo_key: memo_key.to_string(),
        };

        if self.store.insert_activity_info(&info).await? {
            info!(username, "activity info created");
            return Ok(info);
        }

        // Another registration won the race; its row is authoritative.
        self.store
            .find_activity_info(&hashed_username)
            .await?
            .ok_or_else(|| AppError::Internal("activity info vanished after race".to_string()))
    }
}
