//! dynffi - Dynamic Foreign Function Runtime
//!
//! CLI for calling native functions, inspecting struct layouts and checking
//! symbol tables without writing bindings.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use dynffi::config::DynffiConfig;
use dynffi::ffi::{
    DynamicLibrary, FfiContext, ForeignFunction, Primitive, StructDef, TypeDescriptor,
    TypeRegistry, Value,
};
use dynffi::keylite;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter
const LOG_ENV: &str = "DYNFFI_LOG";

#[derive(Parser)]
#[command(name = "dynffi")]
#[command(version)]
#[command(about = "Call native functions through run-time type descriptions", long_about = None)]
struct Cli {
    /// Config file (default: dynffi.toml in the current directory or a parent)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a function in a library
    Call {
        /// Library path or name (`self` for the running process)
        library: String,

        /// Symbol to call
        symbol: String,

        /// Return type
        #[arg(short, long, default_value = "void")]
        ret: String,

        /// Named argument as TYPE=VALUE (repeatable)
        #[arg(short, long = "arg", value_name = "TYPE=VALUE")]
        args: Vec<String>,

        /// Variadic argument as TYPE=VALUE (repeatable)
        #[arg(short = 'v', long = "vararg", value_name = "TYPE=VALUE")]
        varargs: Vec<String>,

        /// Run the call on the worker pool
        #[arg(long)]
        r#async: bool,
    },

    /// Compute a struct layout
    Layout {
        /// Field as NAME:TYPE or NAME:TYPE[LEN] (repeatable, in order)
        #[arg(short, long = "field", value_name = "NAME:TYPE")]
        fields: Vec<String>,

        /// Lay out without padding
        #[arg(long)]
        packed: bool,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Resolve symbols in a library
    Symbols {
        /// Library path or name (`self` for the running process)
        library: String,

        /// Symbols to resolve
        symbols: Vec<String>,

        /// Check the keylite key-value store's symbol table
        #[arg(long)]
        keylite: bool,
    },
}

fn init_logging() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => DynffiConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => DynffiConfig::load_from_cwd().context("Failed to load dynffi.toml")?,
    };

    match cli.command {
        Commands::Call {
            library,
            symbol,
            ret,
            args,
            varargs,
            r#async,
        } => cmd_call(config, &library, &symbol, &ret, &args, &varargs, r#async),
        Commands::Layout {
            fields,
            packed,
            json,
        } => cmd_layout(&fields, packed, json),
        Commands::Symbols {
            library,
            symbols,
            keylite,
        } => cmd_symbols(config, &library, &symbols, keylite),
    }
}

fn open(ctx: &FfiContext, library: &str) -> Result<Arc<DynamicLibrary>> {
    let handle = if library == "self" {
        ctx.open_self()?
    } else {
        ctx.open(library)?
    };
    Ok(handle)
}

/// Split `TYPE=VALUE`
fn split_arg(raw: &str) -> Result<(&str, &str)> {
    raw.split_once('=')
        .map(|(t, v)| (t.trim(), v))
        .ok_or_else(|| anyhow!("expected TYPE=VALUE, got {:?}", raw))
}

/// Parse a command-line value as `ty`
fn parse_value(ty: &TypeDescriptor, raw: &str) -> Result<Value> {
    if ty.is_reference() {
        if raw == "null" || raw == "0" {
            return Ok(Value::Null);
        }
        let addr = raw
            .strip_prefix("0x")
            .map(|hex| usize::from_str_radix(hex, 16))
            .unwrap_or_else(|| raw.parse())
            .with_context(|| format!("invalid address {:?}", raw))?;
        return Ok(Value::Pointer(addr));
    }

    let prim = ty
        .as_primitive()
        .ok_or_else(|| anyhow!("cannot pass {} from the command line", ty))?;
    Ok(match prim {
        Primitive::Void => bail!("void is not an argument type"),
        Primitive::CString => Value::String(raw.to_string()),
        Primitive::Bool => Value::Bool(
            raw.parse()
                .with_context(|| format!("invalid bool {:?}", raw))?,
        ),
        p if p.is_float() => Value::Float(
            raw.parse()
                .with_context(|| format!("invalid number {:?}", raw))?,
        ),
        p if p.is_signed() => Value::Int(
            raw.parse()
                .with_context(|| format!("invalid integer {:?}", raw))?,
        ),
        _ => Value::UInt(
            raw.parse()
                .with_context(|| format!("invalid integer {:?}", raw))?,
        ),
    })
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Void => "(void)".to_string(),
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(v) => v.to_string(),
        Value::UInt(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Pointer(p) => format!("{:#x}", p),
        Value::String(s) => format!("{:?}", s),
        Value::Buffer(b) => format!("<buffer {:#x} len {}>", b.address(), b.len()),
        Value::Struct(s) => format!("<struct {:?}>", s.to_bytes()),
        Value::Function(f) => format!("<function {:#x}>", f.address()),
    }
}

fn cmd_call(
    config: DynffiConfig,
    library: &str,
    symbol: &str,
    ret: &str,
    args: &[String],
    varargs: &[String],
    run_async: bool,
) -> Result<()> {
    let ctx = FfiContext::with_config(config)?;
    let handle = open(&ctx, library)?;

    let mut fixed_types = Vec::with_capacity(args.len());
    let mut values = Vec::with_capacity(args.len() + varargs.len());
    for raw in args {
        let (ty, value) = split_arg(raw)?;
        let ty = ctx.coerce(ty)?;
        values.push(parse_value(&ty, value)?);
        fixed_types.push(ty);
    }
    let mut var_types = Vec::with_capacity(varargs.len());
    for raw in varargs {
        let (ty, value) = split_arg(raw)?;
        let ty = ctx.coerce(ty)?;
        values.push(parse_value(&ty, value)?);
        var_types.push(ty);
    }

    let function = if var_types.is_empty() {
        ctx.function(&handle, symbol, ret, fixed_types)?
    } else {
        let mut all = fixed_types;
        let fixed = all.len();
        all.extend(var_types);
        let cif = ctx.build_variadic_cif(ret, all, fixed, None)?;
        ForeignFunction::new(symbol, handle.get(symbol)?, Arc::new(cif))?
    };

    let result = if run_async {
        function
            .call_async(&values, ctx.worker_pool())
            .wait_on(ctx.host())?
    } else {
        function.call(&values)?
    };
    println!("{}", format_value(&result));
    Ok(())
}

#[derive(Serialize)]
struct LayoutReport {
    size: usize,
    alignment: usize,
    packed: bool,
    fields: Vec<FieldReport>,
}

#[derive(Serialize)]
struct FieldReport {
    name: String,
    #[serde(rename = "type")]
    ty: String,
    offset: usize,
    size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    length: Option<usize>,
}

/// Parse `NAME:TYPE` or `NAME:TYPE[LEN]`
fn parse_field(raw: &str) -> Result<(&str, &str, Option<usize>)> {
    let (name, ty) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("expected NAME:TYPE, got {:?}", raw))?;
    match ty.strip_suffix(']').and_then(|t| t.split_once('[')) {
        Some((elem, len)) => {
            let len = len
                .parse()
                .with_context(|| format!("invalid array length in {:?}", raw))?;
            Ok((name, elem, Some(len)))
        }
        None => Ok((name, ty, None)),
    }
}

fn cmd_layout(fields: &[String], packed: bool, json: bool) -> Result<()> {
    let registry = TypeRegistry::new();
    let mut def = if packed {
        StructDef::packed(None)
    } else {
        StructDef::new(None)
    };
    for raw in fields {
        let (name, ty, len) = parse_field(raw)?;
        let ty = registry.coerce(ty)?;
        match len {
            Some(len) => def.add_array_field(name, ty, len)?,
            None => def.add_field(name, ty)?,
        };
    }

    let desc = def.descriptor();
    let report = LayoutReport {
        size: desc.size(),
        alignment: desc.alignment(),
        packed: desc.is_packed(),
        fields: desc
            .fields()
            .iter()
            .map(|f| FieldReport {
                name: f.name.clone(),
                ty: f.ty.to_string(),
                offset: f.offset,
                size: f.size(),
                length: f.fixed_length,
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{:<16} {:<16} {:>8} {:>8}", "FIELD", "TYPE", "OFFSET", "SIZE");
    for field in &report.fields {
        let ty = match field.length {
            Some(len) => format!("{}[{}]", field.ty, len),
            None => field.ty.clone(),
        };
        println!(
            "{:<16} {:<16} {:>8} {:>8}",
            field.name, ty, field.offset, field.size
        );
    }
    println!(
        "size {} align {}{}",
        report.size,
        report.alignment,
        if report.packed { " (packed)" } else { "" }
    );
    Ok(())
}

fn cmd_symbols(
    config: DynffiConfig,
    library: &str,
    symbols: &[String],
    keylite: bool,
) -> Result<()> {
    let ctx = FfiContext::with_config(config)?;
    let handle = open(&ctx, library)?;

    let mut names: Vec<String> = symbols.to_vec();
    if keylite {
        names.extend(keylite::binding_specs().into_iter().map(|s| s.symbol));
    }
    if names.is_empty() {
        bail!("no symbols given");
    }

    let mut missing = 0;
    for name in &names {
        match handle.get(name) {
            Ok(addr) => println!("{:#018x} {}", addr, name),
            Err(err) => {
                missing += 1;
                println!("{:>18} {} ({})", "missing", name, err);
            }
        }
    }
    if missing > 0 {
        bail!("{} of {} symbols not found", missing, names.len());
    }
    Ok(())
}
