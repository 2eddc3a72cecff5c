use anyhow::Result;
use mimic_engine::LATEST_VERSION;

use super::App;

pub async fn cmd_doctor(app: &App) -> Result<()> {
    for kind in app.registry.kinds() {
        let provider = app.registry.provider(kind, LATEST_VERSION)?;
        let (ok, messages) = provider.check_prereqs().await;
        println!("[{}] {}", if ok { "ok" } else { "missing" }, kind);
        for message in messages {
            println!("      {message}");
        }
    }
    Ok(())
}
