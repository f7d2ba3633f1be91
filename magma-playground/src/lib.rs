use std::path::PathBuf;

use magma_cman::config::CmanConfig;

pub fn load_config(path: Option<PathBuf>) -> anyhow::Result<CmanConfig> {
    let mut builder = CmanConfig::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path))?;
    }
    Ok(builder.build()?)
}
