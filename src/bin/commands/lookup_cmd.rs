use anyhow::{Context, Result};
use ipatlas::Address;
use serde_json::json;

use crate::cli_utils::{format_cidr, load_database};
use crate::LoadArgs;

pub fn cmd_lookup(database: String, address: String, quiet: bool, load: LoadArgs) -> Result<()> {
    let ip = Address::from(address.as_str())
        .resolve()
        .with_context(|| format!("Not an IP address: {}", address))?;

    let (_registry, db) = load_database(&database, &load)?;
    let result = db
        .lookup(ip)
        .with_context(|| format!("Lookup failed for: {}", address))?;

    if quiet {
        // Quiet mode: no output, just exit code
        std::process::exit(if result.is_some() { 0 } else { 1 });
    }

    match result {
        Some(entry) => {
            let mut output = serde_json::to_value(&entry.data)?;
            // Add the matched network to the data object
            if let serde_json::Value::Object(ref mut map) = output {
                map.insert("cidr".to_string(), json!(format_cidr(ip, entry.prefix_len)));
                map.insert("prefix_len".to_string(), json!(entry.prefix_len));
            }
            println!("{}", serde_json::to_string_pretty(&json!([output]))?);
            Ok(())
        }
        None => {
            println!("[]");
            std::process::exit(1);
        }
    }
}
