//! `flashkit logs`

use flashkit::logging;

/// Print the previous session's log; this run has its own file
pub fn print() -> Result<(), String> {
    let Some(path) = logging::previous_session_log() else {
        println!("No earlier session logs");
        return Ok(());
    };
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("Cannot read {}: {}", path.display(), e))?;
    println!("# {}", path.display());
    print!("{}", content);
    Ok(())
}
