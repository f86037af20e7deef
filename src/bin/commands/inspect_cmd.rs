use anyhow::Result;
use serde_json::json;

use crate::cli_utils::{format_bytes, format_unix_timestamp, load_database, unix_seconds};
use crate::LoadArgs;

pub fn cmd_inspect(database: String, json_output: bool, load: LoadArgs) -> Result<()> {
    let (_registry, db) = load_database(&database, &load)?;
    let metadata = db.metadata();
    let version = unix_seconds(db.version());

    if json_output {
        let output = json!({
            "database": database,
            "source": db.source(),
            "version": version,
            "size": db.bytes().len(),
            "metadata": metadata,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Database: {}", database);
    println!("Source:   {}", db.source());
    println!("Version:  {}", format_unix_timestamp(version));
    println!("Size:     {}", format_bytes(db.bytes().len()));
    println!();
    println!("Metadata:");
    println!("  Database type:   {}", metadata.database_type);
    if !metadata.description.is_empty() {
        println!("  Description:");
        for (lang, text) in &metadata.description {
            println!("    {}: {}", lang, text);
        }
    }
    if !metadata.languages.is_empty() {
        println!("  Languages:       {}", metadata.languages.join(", "));
    }
    println!(
        "  Build time:      {} ({})",
        format_unix_timestamp(metadata.build_epoch),
        metadata.build_epoch
    );
    println!(
        "  Format version:  {}.{}",
        metadata.binary_format_major_version, metadata.binary_format_minor_version
    );
    println!("  IP version:      IPv{}", u8::from(metadata.ip_version));
    println!("  Node count:      {}", metadata.node_count);
    println!("  Record size:     {} bits", u16::from(metadata.record_size));
    println!("  Search tree:     {}", format_bytes(metadata.search_tree_size));
    println!(
        "  Data section:    {}",
        format_bytes(db.data_section().len())
    );

    Ok(())
}
