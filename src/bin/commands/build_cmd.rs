use anyhow::{bail, Context, Result};
use ipatlas::{DataValue, MmdbBuilder, RecordSize};
use std::fs;
use std::io::{self, BufRead};
use std::path::PathBuf;

use crate::cli_utils::{format_bytes, parse_field_value};

/// Parse one `cidr,key=value,...` line
fn parse_line(line: &str) -> Result<(String, DataValue)> {
    let mut fields = line.split(',').map(str::trim);
    let cidr = fields.next().unwrap_or_default().to_string();

    let mut pairs = Vec::new();
    for field in fields.filter(|f| !f.is_empty()) {
        let Some((key, value)) = field.split_once('=') else {
            bail!("expected key=value, got '{}'", field);
        };
        pairs.push((key.trim().to_string(), parse_field_value(value.trim())));
    }
    Ok((cidr, DataValue::Map(pairs)))
}

pub fn cmd_build(
    input: PathBuf,
    output: PathBuf,
    database_type: Option<String>,
    description: Option<String>,
    desc_lang: String,
    record_size: u16,
) -> Result<()> {
    let record_size = RecordSize::from_bits(u64::from(record_size))
        .with_context(|| format!("Unsupported record size: {}", record_size))?;

    let mut builder = MmdbBuilder::new()
        .with_record_size(record_size)
        .with_ipv4_mapped_alias();
    if let Some(db_type) = database_type {
        builder = builder.with_database_type(db_type);
    }
    if let Some(desc) = description {
        builder = builder.with_description(desc_lang, desc);
    }

    let reader: Box<dyn BufRead> = if input.to_str() == Some("-") {
        Box::new(io::BufReader::new(io::stdin()))
    } else {
        let file = fs::File::open(&input)
            .with_context(|| format!("Failed to open input file: {}", input.display()))?;
        Box::new(io::BufReader::new(file))
    };

    for (line_num, line) in reader.lines().enumerate() {
        let line = line.context("Failed to read input")?;
        let line = line.trim();
        // Skip blank lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (cidr, data) =
            parse_line(line).with_context(|| format!("Line {}: {}", line_num + 1, line))?;
        builder
            .add_entry(&cidr, data)
            .with_context(|| format!("Line {}: invalid network '{}'", line_num + 1, cidr))?;
    }

    if builder.is_empty() {
        bail!("No networks found in {}", input.display());
    }

    let bytes = builder.build().context("Failed to build database")?;
    fs::write(&output, &bytes)
        .with_context(|| format!("Failed to write output file: {}", output.display()))?;

    eprintln!(
        "Wrote {} networks to {} ({})",
        builder.len(),
        output.display(),
        format_bytes(bytes.len())
    );
    Ok(())
}
