use clap::{Parser, Subcommand};
use dirstore::engine::{CachingStore, DirectoryStore, GenericIndex, IndexKey, IndexedStore, KeyAccessor};
use dirstore::{EntityReader, EntityWriter, Reindex};
use serde_json::Value;
use std::env;

#[derive(Parser)]
#[command(author, version, about = "Inspect and edit a directory of JSON documents", long_about = None)]
struct Cli {
    #[arg(short, long)]
    data_dir: Option<String>,

    /// Document field holding the primary key.
    #[arg(short, long, default_value = "key")]
    key_field: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone)]
enum Commands {
    List,
    Get { key: String },
    /// Lists documents whose `field` equals `value` (parsed as JSON when possible).
    Find { field: String, value: String },
    Insert { document: String },
    Update { document: String },
    Del { key: String },
    Reindex,
}

fn key_accessor(field: &str) -> KeyAccessor<Value> {
    let read_field = field.to_string();
    let write_field = field.to_string();
    KeyAccessor::new(
        move |doc: &Value| doc.get(&read_field).and_then(Value::as_str).map(str::to_string),
        move |doc: &mut Value, key| {
            if let Value::Object(map) = doc {
                map.insert(write_field.clone(), Value::String(key));
            }
        },
    )
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let data_dir = cli
        .data_dir
        .or_else(|| env::var("DIRSTORE_DATA_DIR").ok())
        .unwrap_or_else(|| "data".to_string());

    let base = DirectoryStore::builder(&data_dir, key_accessor(&cli.key_field))
        .entity_type("document")
        .open()?;
    let store = CachingStore::new(base)?;

    match cli.command {
        Commands::List => {
            for doc in store.stream_all() {
                println!("{}", serde_json::to_string(&doc?)?);
            }
        }
        Commands::Get { key } => {
            let doc = store.get(&key)?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        Commands::Find { field, value } => {
            let name = field.clone();
            let index = GenericIndex::range(&field, move |doc: &Value| IndexKey::from(&doc[name.as_str()]));
            let indexed = IndexedStore::new(store, vec![index.clone()])?;
            let target = IndexKey::from(&parse_value(&value));
            for doc in indexed.stream_matching(&index.equals(target)) {
                println!("{}", serde_json::to_string(&doc?)?);
            }
        }
        Commands::Insert { document } => {
            let doc: Value = serde_json::from_str(&document)?;
            anyhow::ensure!(doc.is_object(), "documents must be JSON objects");
            let inserted = store.insert(doc)?;
            println!("{}", serde_json::to_string_pretty(&inserted)?);
        }
        Commands::Update { document } => {
            let doc: Value = serde_json::from_str(&document)?;
            anyhow::ensure!(doc.is_object(), "documents must be JSON objects");
            store.update(doc)?;
            println!("OK");
        }
        Commands::Del { key } => {
            store.delete(&key)?;
            println!("OK");
        }
        Commands::Reindex => {
            store.reindex()?;
            println!("Indexed {} documents in {}", store.len(), data_dir);
        }
    }

    Ok(())
}
