//! `cdm status` – show the queue.

use anyhow::Result;
use cdm_core::store::Store;

pub async fn run_status(store: &Store, with_attempts: bool) -> Result<()> {
    let snapshot = store.get_snapshot(None).await?;
    if snapshot.downloads.is_empty() {
        println!("No downloads in the queue.");
        return Ok(());
    }

    println!(
        "{:<6} {:<18} {:>6} {:>14} {:<8} {}",
        "ID", "STATE", "PROG", "SIZE", "TRIES", "TITLE"
    );
    for d in &snapshot.downloads {
        let size = if d.total_bytes == 0 {
            "-".to_string()
        } else {
            d.total_bytes.to_string()
        };
        println!(
            "{:<6} {:<18} {:>5.0}% {:>14} {:<8} {}",
            d.id,
            d.state.as_str(),
            d.progress * 100.0,
            size,
            d.attempts_count,
            d.title
        );
        if let Some(error) = &d.error_message {
            println!("       error: {}", error);
        }
        if with_attempts {
            for attempt in store.get_attempts(d.id).await? {
                println!(
                    "       attempt {}: {}",
                    attempt.attempt_number, attempt.error
                );
            }
        }
    }
    println!("(snapshot version {})", snapshot.state_version);
    Ok(())
}
