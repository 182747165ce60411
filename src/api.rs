// Presentation-facing surface: every call resolves to an ApiResponse, never an Err
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::error;

use crate::account::AccountController;
use crate::error::BinderError;
use crate::storage::Integrity;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

fn failure<T>(context: &str, err: BinderError) -> ApiResponse<T> {
    error!("{}: {}", context, err);
    ApiResponse::fail(format!("{}: {}", context, err))
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AllocateData {
    pub path: PathBuf,
    pub capacity_mb: u64,
    pub existing_user: bool,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct VerifyData {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    pub status: Integrity,
}

impl VerifyData {
    fn from_status(status: Integrity) -> Self {
        Self {
            valid: status.is_valid(),
            reason: status.reason(),
            status,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct AccountData {
    pub address: String,
    pub mnemonic: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoginData {
    pub address: String,
    pub storage_recreated: bool,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PhraseData {
    pub mnemonic: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct AddressData {
    pub address: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExistingUserData {
    pub existing_user: bool,
}

/// Wraps an [`AccountController`] and flattens its results for a UI.
#[derive(Clone)]
pub struct AccountApi {
    controller: AccountController,
}

impl AccountApi {
    pub fn new(controller: AccountController) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &AccountController {
        &self.controller
    }

    pub async fn allocate(&self, directory: &Path, capacity_mb: u64) -> ApiResponse<AllocateData> {
        match self.controller.allocate(directory, capacity_mb).await {
            Ok(outcome) => ApiResponse::ok(
                "Storage allocated successfully.",
                AllocateData {
                    capacity_mb: outcome.unit.capacity_mb(),
                    path: outcome.unit.file_path,
                    existing_user: outcome.existing_user,
                },
            ),
            Err(e) => failure("Storage allocation failed", e),
        }
    }

    pub async fn verify(&self) -> ApiResponse<VerifyData> {
        match self.controller.verify().await {
            Ok(status) if status.is_valid() => {
                ApiResponse::ok("Storage file verified.", VerifyData::from_status(status))
            }
            Ok(status) => ApiResponse {
                success: false,
                message: format!("Storage check failed: {}", status),
                data: Some(VerifyData::from_status(status)),
            },
            Err(e) => failure("Storage check failed", e),
        }
    }

    pub async fn select_manually(&self, path: &Path) -> ApiResponse<AllocateData> {
        match self.controller.select_manually(path).await {
            Ok(outcome) => ApiResponse::ok(
                "Storage file selected successfully.",
                AllocateData {
                    capacity_mb: outcome.unit.capacity_mb(),
                    path: outcome.unit.file_path,
                    existing_user: outcome.existing_user,
                },
            ),
            Err(e) => failure("Storage selection failed", e),
        }
    }

    pub async fn create_account(&self) -> ApiResponse<AccountData> {
        match self.controller.create_account().await {
            Ok(created) => ApiResponse::ok(
                "New account created successfully.",
                AccountData {
                    address: created.address,
                    mnemonic: created.phrase,
                },
            ),
            Err(e) => failure("Failed to create new account", e),
        }
    }

    pub async fn login_with_phrase(&self, phrase: &str) -> ApiResponse<LoginData> {
        match self.controller.login_with_phrase(phrase).await {
            Ok(login) => ApiResponse::ok(
                if login.storage_recreated {
                    "Logged in successfully. Storage file was recreated."
                } else {
                    "Logged in successfully."
                },
                LoginData {
                    address: login.address,
                    storage_recreated: login.storage_recreated,
                },
            ),
            Err(e) => failure("Failed to process recovery phrase", e),
        }
    }

    pub async fn get_recovery_phrase(&self) -> ApiResponse<PhraseData> {
        match self.controller.get_recovery_phrase().await {
            Ok(Some(mnemonic)) => ApiResponse::ok("Recovery phrase retrieved.", PhraseData { mnemonic }),
            Ok(None) => ApiResponse::fail(BinderError::NoAccount.to_string()),
            Err(e) => failure("Failed to read recovery phrase", e),
        }
    }

    pub async fn get_address(&self) -> ApiResponse<AddressData> {
        match self.controller.get_address().await {
            Some(address) => ApiResponse::ok("Address found.", AddressData { address }),
            None => ApiResponse::fail(BinderError::NoAccount.to_string()),
        }
    }

    pub async fn check_existing_user(&self) -> ApiResponse<ExistingUserData> {
        let existing_user = self.controller.has_account().await;
        ApiResponse::ok(
            if existing_user {
                "An account exists for this storage."
            } else {
                "No existing account."
            },
            ExistingUserData { existing_user },
        )
    }

    pub async fn update_server(&self) -> ApiResponse<()> {
        match self.controller.update_server().await {
            Ok(()) => ApiResponse {
                success: true,
                message: "Distributed storage updated successfully.".to_string(),
                data: None,
            },
            Err(e) => failure("Failed to update distributed storage with the server", e),
        }
    }

    pub async fn remove_storage(&self) -> ApiResponse<()> {
        match self.controller.remove_storage().await {
            Ok(()) => ApiResponse {
                success: true,
                message: "Server notified about storage removal.".to_string(),
                data: None,
            },
            Err(e) => failure("Failed to notify server about storage removal", e),
        }
    }

    pub async fn reset(&self) -> ApiResponse<()> {
        match self.controller.reset().await {
            Ok(()) => ApiResponse {
                success: true,
                message: "Account reset successfully.".to_string(),
                data: None,
            },
            Err(e) => failure("Failed to reset account", e),
        }
    }
}
