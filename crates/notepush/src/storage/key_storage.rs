use crate::{Error, Result};
use tnostr::{Keypair, Pubkey, SerializableKeypair};

use super::file_storage::{delete_file, write_file, DataPath, DataPathType, Directory};

static SELECTED_PUBKEY_FILE_NAME: &str = "selected_pubkey";

/// An OS agnostic file key storage implementation. Also the durable hint
/// store: remote-signer identities persist their bunker URI here so a
/// later process start can reconnect.
#[derive(Debug, PartialEq, Clone)]
pub struct FileKeyStorage {
    keys_directory: Directory,
    selected_key_directory: Directory,
    bunkers_directory: Directory,
}

impl FileKeyStorage {
    pub fn new(path: &DataPath) -> Self {
        Self {
            keys_directory: Directory::new(path.path(DataPathType::Keys)),
            selected_key_directory: Directory::new(path.path(DataPathType::SelectedKey)),
            bunkers_directory: Directory::new(path.path(DataPathType::Bunkers)),
        }
    }

    pub fn add_key(&self, key: &Keypair) -> Result<()> {
        write_file(
            &self.keys_directory.file_path,
            key.pubkey.hex(),
            &serde_json::to_string(&SerializableKeypair::from_keypair(key, "", 7))?,
        )
    }

    pub fn get_keys(&self) -> Result<Vec<Keypair>> {
        let keys = match self.keys_directory.get_files() {
            Ok(files) => files
                .values()
                .filter_map(|str_key| serde_json::from_str::<SerializableKeypair>(str_key).ok())
                .map(|serializable_keypair| serializable_keypair.to_keypair(""))
                .collect(),
            Err(Error::Io(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        Ok(keys)
    }

    pub fn remove_key(&self, pubkey: &Pubkey) -> Result<()> {
        delete_file(&self.keys_directory.file_path, pubkey.hex())
    }

    pub fn get_selected_key(&self) -> Result<Option<Pubkey>> {
        match self
            .selected_key_directory
            .get_file(SELECTED_PUBKEY_FILE_NAME.to_owned())
        {
            Ok(pubkey_str) => Ok(Some(serde_json::from_str(&pubkey_str)?)),
            Err(Error::Io(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn select_key(&self, pubkey: Option<Pubkey>) -> Result<()> {
        if let Some(pubkey) = pubkey {
            write_file(
                &self.selected_key_directory.file_path,
                SELECTED_PUBKEY_FILE_NAME.to_owned(),
                &serde_json::to_string(&pubkey)?,
            )
        } else if self
            .selected_key_directory
            .get_file(SELECTED_PUBKEY_FILE_NAME.to_owned())
            .is_ok()
        {
            // Case where user chose to have no selected pubkey, but one already exists
            delete_file(
                &self.selected_key_directory.file_path,
                SELECTED_PUBKEY_FILE_NAME.to_owned(),
            )
        } else {
            Ok(())
        }
    }

    pub fn add_bunker_hint(&self, pubkey: &Pubkey, uri: &str) -> Result<()> {
        write_file(
            &self.bunkers_directory.file_path,
            pubkey.hex(),
            &serde_json::to_string(uri)?,
        )
    }

    pub fn get_bunker_hint(&self, pubkey: &Pubkey) -> Option<String> {
        self.bunkers_directory
            .get_file(pubkey.hex())
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
    }

    pub fn get_bunker_hints(&self) -> Vec<(Pubkey, String)> {
        let Ok(files) = self.bunkers_directory.get_files() else {
            return Vec::new();
        };
        files
            .into_iter()
            .filter_map(|(name, contents)| {
                let pubkey = Pubkey::from_hex(&name).ok()?;
                let uri: String = serde_json::from_str(&contents).ok()?;
                Some((pubkey, uri))
            })
            .collect()
    }

    pub fn remove_bunker_hint(&self, pubkey: &Pubkey) -> Result<()> {
        match delete_file(&self.bunkers_directory.file_path, pubkey.hex()) {
            Ok(()) => Ok(()),
            // removing an absent hint is not an error, disconnect paths race
            Err(Error::Generic(_)) | Err(Error::Io(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
impl FileKeyStorage {
    /// Throwaway storage rooted in temp directories.
    pub(crate) fn mock() -> Result<Self> {
        let tmp_dir = || -> Result<std::path::PathBuf> {
            Ok(tempfile::TempDir::new()?.path().to_path_buf())
        };
        Ok(Self {
            keys_directory: Directory::new(tmp_dir()?),
            selected_key_directory: Directory::new(tmp_dir()?),
            bunkers_directory: Directory::new(tmp_dir()?),
        })
    }
}
