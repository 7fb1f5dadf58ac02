//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;

use crate::{
    async_utils::io::write_text_atomic, corpus::LogbookCorpus, entry::LogbookEntry,
    prelude::*,
};

/// The different schema types we support.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SchemaType {
    /// A single page, as written to `<page>.json`.
    Entry,
    /// The complete corpus, as written to `complete_logbook.json`.
    Corpus,
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema type to generate.
    #[clap(value_enum, value_name = "TYPE", default_value = "corpus")]
    pub schema_type: SchemaType,

    /// The output path to write the schema to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(schema_opts: &SchemaOpts) -> Result<()> {
    let schema = match schema_opts.schema_type {
        SchemaType::Entry => schema_for!(LogbookEntry),
        SchemaType::Corpus => schema_for!(LogbookCorpus),
    };
    let schema_str =
        serde_json::to_string_pretty(&schema).context("failed to serialize schema")?;
    match &schema_opts.output_path {
        Some(path) => write_text_atomic(path, &schema_str).await?,
        None => println!("{schema_str}"),
    }
    Ok(())
}
