use std::env;

use async_std::fs;
use async_std::path::{Path, PathBuf};

use crate::common::env::{ENV_CACHE_PATH_DEFAULT, ENV_CACHE_PATH_KEY};
use crate::error::{io, Result};

fn cache_root() -> String {
    env::var(ENV_CACHE_PATH_KEY)
        .unwrap_or(ENV_CACHE_PATH_DEFAULT.to_string())
}

pub async fn cache_file_path(path: &str, create_dir: bool) -> Result<PathBuf> {
    let cache_file = PathBuf::from(format!("{}/{}", cache_root(), path));

    if create_dir {
        if let Some(parent) = cache_file.parent() {
            cache_create_path(parent).await?;
        }
    }

    Ok(cache_file)
}

pub async fn cache_dir_path(path: &str, create: bool) -> Result<PathBuf> {
    let cache_path = PathBuf::from(format!("{}/{}", cache_root(), path));

    if create {
        cache_create_path(cache_path.as_path()).await?;
    }

    Ok(cache_path)
}

async fn cache_create_path(cache_path: &Path) -> Result<()> {
    if !cache_path.exists().await {
        fs::create_dir_all(&cache_path).await
            .map_err(|e| io(e, Some(format!("failed to create cache dir: {} \
                (hint: you can change the path by setting {})",
                                            cache_path.display(), ENV_CACHE_PATH_KEY))))?;
    }

    Ok(())
}
