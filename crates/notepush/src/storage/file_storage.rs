use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};

use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct DataPath {
    base: PathBuf,
}

impl DataPath {
    pub fn new(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref().to_path_buf();
        Self { base }
    }

    pub fn default_base() -> Option<PathBuf> {
        dirs::data_local_dir().map(|pb| pb.join("notepush"))
    }

    pub fn default_base_or_cwd() -> PathBuf {
        use std::str::FromStr;
        Self::default_base().unwrap_or_else(|| PathBuf::from_str(".").unwrap())
    }

    pub fn rel_path(&self, typ: DataPathType) -> PathBuf {
        match typ {
            DataPathType::Keys => PathBuf::from("storage").join("accounts"),
            DataPathType::SelectedKey => PathBuf::from("storage").join("selected_account"),
            DataPathType::Bunkers => PathBuf::from("storage").join("bunkers"),
        }
    }

    pub fn path(&self, typ: DataPathType) -> PathBuf {
        self.base.join(self.rel_path(typ))
    }
}

impl Default for DataPath {
    fn default() -> Self {
        Self::new(Self::default_base_or_cwd())
    }
}

pub enum DataPathType {
    Keys,
    SelectedKey,
    Bunkers,
}

#[derive(Debug, PartialEq, Clone)]
pub struct Directory {
    pub file_path: PathBuf,
}

impl Directory {
    pub fn new(file_path: PathBuf) -> Self {
        Self { file_path }
    }

    /// Get the files in the current directory where the key is the file name and the value is the file contents
    pub fn get_files(&self) -> Result<HashMap<String, String>> {
        let dir = fs::read_dir(self.file_path.clone())?;
        let map = dir
            .filter_map(|f| f.ok())
            .filter(|f| f.path().is_file())
            .filter_map(|f| {
                let file_name = f.file_name().into_string().ok()?;
                let contents = fs::read_to_string(f.path()).ok()?;
                Some((file_name, contents))
            })
            .collect();

        Ok(map)
    }

    pub fn get_file(&self, file_name: String) -> Result<String> {
        let filepath = self.file_path.clone().join(file_name.clone());

        if filepath.exists() && filepath.is_file() {
            Ok(fs::read_to_string(filepath)?)
        } else {
            Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Requested file was not found: {file_name}"),
            )))
        }
    }
}

/// Write the file to the directory
pub fn write_file(directory: &Path, file_name: String, data: &str) -> Result<()> {
    if !directory.exists() {
        fs::create_dir_all(directory)?
    }

    std::fs::write(directory.join(file_name), data)?;
    Ok(())
}

pub fn delete_file(directory: &Path, file_name: String) -> Result<()> {
    let file_to_delete = directory.join(file_name.clone());
    if file_to_delete.exists() && file_to_delete.is_file() {
        fs::remove_file(file_to_delete).map_err(Error::Io)
    } else {
        Err(Error::Generic(format!(
            "Requested file to delete was not found: {file_name}"
        )))
    }
}
