use std::{fs, io::{self, Write}, path::PathBuf};

use crate::{api, prelude::*};

pub(crate) mod check;


/// Reads stdin and returns an error if the trimmed input is not exactly "yes".
pub(crate) fn prompt_for_yes() -> Result<()> {
    let mut line = String::new();
    io::stdin().read_line(&mut line).context("could not read from stdin")?;
    if line.trim() != "yes" {
        println!("Answer was not 'yes'. Aborting.");
        bail!("user did not confirm: operation was aborted.");
    }
    Ok(())
}

/// Writes the GraphQL schema in SDL to the given file or stdout.
pub(crate) fn export_api_schema(target: Option<&PathBuf>) -> Result<()> {
    let schema = api::root_node().as_sdl();
    match target {
        Some(path) => fs::write(path, schema)
            .with_context(|| format!("failed to write schema to '{}'", path.display()))?,
        None => io::stdout().write_all(schema.as_bytes())?,
    }

    Ok(())
}
