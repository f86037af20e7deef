use anyhow::Result;
use ipatlas::analysis;
use serde_json::json;

use crate::cli_utils::load_database;
use crate::LoadArgs;

pub fn cmd_analyze(database: String, json_output: bool, load: LoadArgs) -> Result<()> {
    let (_registry, db) = load_database(&database, &load)?;
    let result = analysis::analyze(&db);
    let flaws = result.as_ref().err().cloned().unwrap_or_default();

    if json_output {
        let output = json!({
            "database": database,
            "source": db.source(),
            "is_valid": flaws.is_empty(),
            "flaws": flaws,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Database: {}", database);
        println!("Nodes:    {}", db.metadata().node_count);
        println!();
        if flaws.is_empty() {
            println!("✓ No flaws found");
        } else {
            println!("✗ {} flaw(s) found:", flaws.len());
            for flaw in &flaws {
                println!("  - {}", flaw);
            }
        }
    }

    if !flaws.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}
