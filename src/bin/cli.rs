//! boxdb - CLI Client
//!
//! Usage: `boxdb-cli <dir> [--schema schema.json] [--config config.json]`

use std::env;

use anyhow::{anyhow, bail, Context};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use serde_json::{Map, Number, Value as Json};

use boxdb::catalog::EntityType;
use boxdb::query::parse_query;
use boxdb::{Entity, EntityId, Schema, Store, StoreConfig, TypeTag, Value};

/// Print welcome banner
fn print_banner(store: &Store) {
    println!(
        r#"
 _               _ _
| |__   _____  _| | |__
| '_ \ / _ \ \/ / | '_ \
| |_) | (_) >  <| | |_) |
|_.__/ \___/_/\_\_|_.__/

 An embedded object store, version {}
 Type '.help' for help, '.quit' to exit
"#,
        store.version()
    );
}

/// Print help message
fn print_help() {
    println!(
        r#"
Commands:
  .help              Show this help message
  .quit              Exit
  .types             List all entity types
  .schema [type]     Show entity type definitions
  .stats             Show store counters
  .compact           Rewrite sparse pages

Statements:
  put <Type> <json>                      Insert or replace (set "id" to replace)
  get <Type> <id>                        Show one entity
  remove <Type> <id>                     Remove one entity
  find <Type> [where <predicate>] [order by <prop> [asc|desc], ...] [limit n] [offset n]
  count <Type> [where <predicate>]

Examples:
  put Person {{"name": "Ann", "age": 31}}
  find Person where age >= 30 and name startswith nocase "a" order by age desc limit 5
  count Person where email is null
"#
    );
}

// ========== JSON conversion ==========

fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(v) => Json::Bool(*v),
        Value::Byte(v) => Json::from(*v),
        Value::Short(v) => Json::from(*v),
        Value::Int(v) => Json::from(*v),
        Value::Long(v) | Value::Date(v) => Json::from(*v),
        Value::Float(v) => Number::from_f64(f64::from(*v)).map_or(Json::Null, Json::Number),
        Value::Double(v) => Number::from_f64(*v).map_or(Json::Null, Json::Number),
        Value::String(v) => Json::String(v.clone()),
        Value::Bytes(v) => Json::Array(v.iter().map(|b| Json::from(*b)).collect()),
    }
}

fn entity_to_json(entity: &Entity) -> Json {
    let mut object = Map::new();
    object.insert("id".to_string(), Json::from(entity.id.get()));
    for (name, value) in &entity.values {
        object.insert(name.clone(), value_to_json(value));
    }
    Json::Object(object)
}

fn json_to_value(json: &Json, tag: TypeTag) -> anyhow::Result<Value> {
    let value = match json {
        Json::Null => return Ok(Value::Null),
        Json::Bool(v) => Value::Bool(*v),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Long(i),
            None => Value::Double(n.as_f64().ok_or_else(|| anyhow!("bad number {}", n))?),
        },
        Json::String(s) => Value::String(s.clone()),
        Json::Array(items) if tag == TypeTag::ByteVector => Value::Bytes(
            items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|b| u8::try_from(b).ok())
                        .ok_or_else(|| anyhow!("byte vectors hold integers 0..=255"))
                })
                .collect::<anyhow::Result<_>>()?,
        ),
        other => bail!("cannot store {} as {}", other, tag),
    };
    value
        .coerce_to(tag)
        .ok_or_else(|| anyhow!("{} is not a valid {} value", json, tag))
}

fn json_to_entity(ty: &EntityType, json: &str) -> anyhow::Result<Entity> {
    let parsed: Json = serde_json::from_str(json).context("entity must be a JSON object")?;
    let Json::Object(object) = parsed else {
        bail!("entity must be a JSON object");
    };
    let mut entity = Entity::new();
    for (name, json) in &object {
        let prop = ty.require_property(name)?;
        if prop.is_id {
            let id = json
                .as_u64()
                .ok_or_else(|| anyhow!("'{}' must be a positive integer", name))?;
            entity.id = EntityId::new(id);
        } else {
            entity.insert(name.clone(), json_to_value(json, prop.type_tag)?);
        }
    }
    Ok(entity)
}

// ========== Statements ==========

/// Split off the next whitespace-delimited word
fn next_word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.find(char::is_whitespace) {
        Some(end) => (&input[..end], input[end..].trim_start()),
        None => (input, ""),
    }
}

fn parse_id(text: &str) -> anyhow::Result<EntityId> {
    let id: u64 = text
        .trim()
        .parse()
        .with_context(|| format!("'{}' is not an entity id", text.trim()))?;
    Ok(EntityId::new(id))
}

/// Strip a leading `where` keyword
fn where_clause(rest: &str) -> &str {
    let (word, after) = next_word(rest);
    if word.eq_ignore_ascii_case("where") {
        after
    } else {
        rest
    }
}

fn execute_statement(store: &Store, line: &str) -> anyhow::Result<()> {
    let (command, rest) = next_word(line);
    let (type_name, rest) = next_word(rest);
    if type_name.is_empty() {
        bail!("'{}' needs an entity type; type '.help' for usage", command);
    }
    let entities = store.entity_box(type_name)?;

    match command.to_ascii_lowercase().as_str() {
        "put" => {
            let entity = json_to_entity(entities.entity_type(), rest)?;
            let id = entities.put(&entity)?;
            println!("put {} {}", type_name, id);
        }
        "get" => match entities.get(parse_id(rest)?)? {
            Some(entity) => println!("{}", serde_json::to_string_pretty(&entity_to_json(&entity))?),
            None => println!("not found"),
        },
        "remove" => {
            let removed = entities.remove(parse_id(rest)?)?;
            println!("{}", if removed { "removed" } else { "not found" });
        }
        "find" => {
            let parsed = parse_query(where_clause(rest))?;
            let mut query = match parsed.predicate {
                Some(predicate) => entities.query(predicate)?,
                None => entities.query_all()?,
            };
            for key in parsed.order {
                query = query.order(key);
            }
            if let Some(limit) = parsed.limit {
                query = query.limit(limit);
            }
            if let Some(offset) = parsed.offset {
                query = query.offset(offset);
            }
            tracing::debug!(plan = %query.explain(), "find");
            let found = query.find()?;
            for entity in &found {
                println!("{}", entity_to_json(entity));
            }
            println!("{} entit{} found", found.len(), if found.len() == 1 { "y" } else { "ies" });
        }
        "count" => {
            let rest = where_clause(rest);
            let count = if rest.trim().is_empty() {
                entities.count()?
            } else {
                entities.query(boxdb::Predicate::parse(rest)?)?.count()?
            };
            println!("{}", count);
        }
        other => bail!("unknown statement '{}'; type '.help' for usage", other),
    }
    Ok(())
}

/// Handle special dot commands; returns false to quit
fn handle_special_command(store: &Store, cmd: &str) -> anyhow::Result<bool> {
    let parts: Vec<&str> = cmd.split_whitespace().collect();

    match parts.first().copied() {
        Some(".help") => print_help(),
        Some(".quit") | Some(".exit") => {
            println!("Goodbye!");
            return Ok(false);
        }
        Some(".types") => {
            let names = store.type_names();
            if names.is_empty() {
                println!("No entity types.");
            } else {
                for name in names {
                    println!("  {}", name);
                }
            }
        }
        Some(".schema") => match parts.get(1) {
            Some(name) => println!("{}", store.type_info(name)?),
            None => {
                for name in store.type_names() {
                    println!("{}", store.type_info(&name)?);
                }
            }
        },
        Some(".stats") => {
            let stats = store.stats();
            println!("version:        {}", stats.version);
            println!("schema version: {}", stats.schema_version);
            for (name, count) in &stats.entities {
                println!("  {:<20} {}", name, count);
            }
            println!("pages:          {:?}", stats.allocator);
            println!("cache:          {:?}", stats.cache);
            println!("open snapshots: {}", stats.open_snapshots);
        }
        Some(".compact") => {
            let stats = store.compact()?;
            println!(
                "examined {} pages, {} sparse, moved {} records (version {})",
                stats.pages_examined, stats.sparse_pages, stats.records_moved, stats.version
            );
        }
        Some(other) => {
            eprintln!("Unknown command: {}", other);
            eprintln!("Type '.help' for available commands.");
        }
        None => {}
    }
    Ok(true)
}

struct Args {
    dir: String,
    schema: Option<String>,
    config: Option<String>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = env::args().skip(1);
    let mut dir = None;
    let mut schema = None;
    let mut config = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--schema" | "-s" => schema = Some(args.next().context("--schema needs a path")?),
            "--config" | "-c" => config = Some(args.next().context("--config needs a path")?),
            _ if dir.is_none() => dir = Some(arg),
            other => bail!("unexpected argument '{}'", other),
        }
    }
    Ok(Args {
        dir: dir.context("usage: boxdb-cli <dir> [--schema schema.json] [--config config.json]")?,
        schema,
        config,
    })
}

fn open_store(args: &Args) -> anyhow::Result<Store> {
    let config = match &args.config {
        Some(path) => StoreConfig::from_json_file(path)
            .with_context(|| format!("cannot load config from {}", path))?,
        None => StoreConfig::default(),
    };
    let store = match &args.schema {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read schema {}", path))?;
            let schema = Schema::from_json_str(&text)?;
            Store::open_with_config(&args.dir, &schema, config)?
        }
        None => Store::open_existing(&args.dir, config)?,
    };
    Ok(store)
}

/// Main REPL loop
fn run_repl(store: &Store) -> anyhow::Result<()> {
    let mut editor = DefaultEditor::new()?;
    print_banner(store);

    loop {
        match editor.readline("boxdb> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);
                let outcome = if line.starts_with('.') {
                    handle_special_command(store, line)
                } else {
                    execute_statement(store, line).map(|_| true)
                };
                match outcome {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => eprintln!("Error: {:#}", e),
                }
            }
            Err(ReadlineError::Interrupted) => println!("Use .quit or Ctrl-D to exit"),
            Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args()?;
    let store = open_store(&args)?;
    run_repl(&store)
}
