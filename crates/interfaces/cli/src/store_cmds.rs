use anyhow::{Result, anyhow, bail};

use notekeep_config::AppConfig;
use notekeep_persistence::{DurableStore, NoteId, SaveTrigger, StoreStatus};

pub(crate) async fn put(config: &AppConfig, id: &str, title: &str, content: String) -> Result<()> {
    let store = DurableStore::open(config).await?;
    let id = NoteId::from(id);
    let result = store.save(&id, title, &content, SaveTrigger::User).await;
    let status = store.subscribe_status().borrow().clone();
    store.shutdown().await;

    match result {
        Ok(meta) => {
            println!("{}", serde_json::to_string_pretty(&meta)?);
            Ok(())
        }
        Err(err) => {
            if let StoreStatus::EmergencyCopy { path, .. } = status {
                eprintln!("emergency copy written to {}", path.display());
            }
            Err(anyhow!(err).context(format!("store {id}")))
        }
    }
}

pub(crate) async fn get(config: &AppConfig, id: &str) -> Result<()> {
    let store = DurableStore::open(config).await?;
    let id = NoteId::from(id);
    let content = store.load(&id).await;
    let meta = store.load_metadata(&id).await;
    store.shutdown().await;

    let Some(content) = content? else {
        bail!("no note {id} in {}", config.storage.data_path);
    };
    if let Some(meta) = meta? {
        eprintln!(
            "{} ({} bytes, saved {})",
            if meta.title.is_empty() { "untitled" } else { meta.title.as_str() },
            meta.size,
            meta.saved_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    print!("{content}");
    Ok(())
}
