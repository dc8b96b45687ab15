use anyhow::{bail, Context, Result};
use arrow_array::RecordBatch;
use clap::{Args, Parser, Subcommand};
use mutascope_core::{
    apply_predicate, mutations_schema, parse_predicate, parse_system_query, project,
    CatalogFile, Predicate, SystemMutations, SystemTablesConfig, MUTATIONS_COLUMNS,
    MUTATIONS_TABLE, SYSTEM_DATABASE,
};
use std::path::{Path, PathBuf};

mod rc;
mod render;

use rc::{OutputFormat, RcConfig};

#[derive(Parser)]
#[command(name = "mutascope")]
#[command(about = "Inspect system.mutations over a catalog file", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Debug)]
struct OutputArgs {
    /// Output format. Default: table or from ~/.mutascoperc
    #[arg(short, long, value_enum)]
    format: Option<OutputFormat>,
    /// Rows per output block. Default: 65536 or from ~/.mutascoperc
    #[arg(long)]
    max_block_size: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print system.mutations rows for a catalog
    ///
    /// Defaults can be configured in ~/.mutascoperc (TOML format).
    /// CLI arguments override config file settings.
    Show {
        /// Catalog file (.json or .toml)
        #[arg(short, long)]
        catalog: PathBuf,
        /// WHERE clause body, e.g. "database = 'db1' AND is_done = 0"
        #[arg(short = 'w', long = "where")]
        filter: Option<String>,
        /// Comma separated columns to print (default: all)
        #[arg(long, value_delimiter = ',')]
        columns: Vec<String>,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Run `SELECT ... FROM system.mutations [WHERE ...]` against a catalog
    Query {
        #[arg(short, long)]
        catalog: PathBuf,
        sql: String,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Print the system.mutations schema
    Schema,
}

fn init_logging() {
    let log_format = std::env::var("MUTASCOPE_LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::WARN.into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::WARN.into()),
            )
            .init();
    }
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let rc = RcConfig::load();

    match cli.command {
        Commands::Show {
            catalog,
            filter,
            columns,
            output,
        } => {
            let predicate = match filter.as_deref() {
                Some(sql) => parse_predicate(sql)?,
                None => Predicate::True,
            };
            let columns = if columns.is_empty() {
                None
            } else {
                Some(columns)
            };
            run_select(&catalog, columns, &predicate, &output, &rc)?;
        }
        Commands::Query {
            catalog,
            sql,
            output,
        } => {
            let query = parse_system_query(&sql)?;
            if query.table != MUTATIONS_TABLE
                || query
                    .database
                    .as_deref()
                    .is_some_and(|db| db != SYSTEM_DATABASE)
            {
                bail!(
                    "only {SYSTEM_DATABASE}.{MUTATIONS_TABLE} can be queried, got {}{}",
                    query.database.map(|db| format!("{db}.")).unwrap_or_default(),
                    query.table
                );
            }
            run_select(&catalog, query.columns, &query.predicate, &output, &rc)?;
        }
        Commands::Schema => {
            let schema = mutations_schema();
            let mut table = comfy_table::Table::new();
            table.set_header(vec!["Column", "Type", "Nullable"]);
            for field in schema.fields() {
                table.add_row(vec![
                    field.name().to_string(),
                    field.data_type().to_string(),
                    field.is_nullable().to_string(),
                ]);
            }
            println!("{table}");
        }
    }

    Ok(())
}

fn run_select(
    catalog: &Path,
    columns: Option<Vec<String>>,
    predicate: &Predicate,
    output: &OutputArgs,
    rc: &RcConfig,
) -> Result<()> {
    let catalog_file = CatalogFile::load(catalog)
        .with_context(|| format!("loading catalog {}", catalog.display()))?;
    let registry = catalog_file.build_registry()?;

    let mut config = SystemTablesConfig::new();
    if let Some(rows) = output.max_block_size.or(rc.max_block_size) {
        config = config.with_max_block_size(rows);
    }
    let system = SystemMutations::new(config)?;

    let columns: Vec<String> = columns
        .unwrap_or_else(|| MUTATIONS_COLUMNS.iter().map(|c| c.to_string()).collect());
    let columns: Vec<&str> = columns.iter().map(String::as_str).collect();

    let result = system.read(&columns, predicate, &registry)?;
    tracing::debug!(
        candidates = result.stats.candidates,
        survivors = result.stats.survivors,
        rows = result.stats.rows,
        stage = ?result.stage,
        "read finished"
    );

    // The read only pruned tables; finish the filter on the full rows.
    let batches = result
        .batches
        .iter()
        .map(|batch| project(&apply_predicate(batch, predicate)?, &columns))
        .collect::<Result<Vec<RecordBatch>, _>>()?;
    let schema = project(&RecordBatch::new_empty(system.schema()), &columns)?.schema();

    let format = output.format.unwrap_or_else(|| rc.output_format());
    let text = match format {
        OutputFormat::Table => render::render_table(&schema, &batches)?,
        OutputFormat::Json => render::render_json_lines(&batches)?,
    };
    print!("{text}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_show() {
        let cli = Cli::try_parse_from([
            "mutascope",
            "show",
            "--catalog",
            "c.toml",
            "--where",
            "database = 'db1'",
            "--columns",
            "database,mutation_id",
            "--format",
            "json",
        ])
        .unwrap();
        match cli.command {
            Commands::Show {
                catalog,
                filter,
                columns,
                output,
            } => {
                assert_eq!(catalog, PathBuf::from("c.toml"));
                assert_eq!(filter.as_deref(), Some("database = 'db1'"));
                assert_eq!(columns, vec!["database", "mutation_id"]);
                assert_eq!(output.format, Some(OutputFormat::Json));
            }
            _ => panic!("expected show"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_format() {
        assert!(Cli::try_parse_from(["mutascope", "show", "-c", "x.json", "-f", "csv"]).is_err());
    }

    #[test]
    fn test_run_select_on_fixture() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"{"databases":[{"name":"db1","tables":[
                {"name":"t2","mutations":[
                    {"id":"0001","command":"DELETE WHERE 1","create_time":0,"parts_to_do":1},
                    {"id":"0002","command":"DELETE WHERE 2","create_time":0,"is_done":true}]}]}]}"#,
        )
        .unwrap();
        let output = OutputArgs {
            format: Some(OutputFormat::Json),
            max_block_size: Some(1),
        };
        let predicate = parse_predicate("is_done = 0").unwrap();
        run_select(
            &path,
            Some(vec!["mutation_id".into()]),
            &predicate,
            &output,
            &RcConfig::default(),
        )
        .unwrap();

        let err = run_select(
            &dir.path().join("missing.json"),
            None,
            &Predicate::True,
            &output,
            &RcConfig::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("loading catalog"));
    }
}
