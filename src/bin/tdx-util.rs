//! # tdx-util
//!
//! Maintenance tool for a tradindexed overview directory.
//!
//! ## Usage
//!
//! ```bash
//! # Dump the whole group index, naming groups from an active file
//! tdx-util index -p /var/spool/overview --active /var/lib/news/active
//!
//! # Dump one group's entry, its IDX slots, or its overview records
//! tdx-util index -p ./ov -n example.test
//! tdx-util group-index -p ./ov -n example.test
//! tdx-util overview -p ./ov -n example.test -a 100-200
//!
//! # Export a group and rebuild it from the export
//! tdx-util export -p ./ov -n example.test > example.test.dump
//! tdx-util rebuild -p ./ov -n example.test -i example.test.dump
//!
//! # Create a group, audit, repair
//! tdx-util create -p ./ov -n example.test -f y
//! tdx-util audit -p ./ov --active /var/lib/news/active
//! tdx-util fix -p ./ov --active /var/lib/news/active
//! ```
//!
//! Article ranges are `N`, `N-M`, `N-` (to the high water mark), or `-M`
//! (from the low water mark).
//!
//! Export lines have the form `@TOKEN@ arrived expires overview`, where
//! `overview` is the record without its trailing CRLF and starts with the
//! article number.
//!
//! Set `RUST_LOG` (e.g. `RUST_LOG=debug`) for diagnostic output on stderr.

use std::env;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;

use eyre::{bail, eyre, Result, WrapErr};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use tradindexed::data::GroupData;
use tradindexed::index::{parse_active, print_entry, ActiveGroup};
use tradindexed::{Article, OpenMode, Token, Tradindexed};

fn main() {
    init_logging();
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Index,
    GroupIndex,
    Overview,
    Export,
    Create,
    Audit,
    Fix,
    Rebuild,
}

impl Command {
    fn parse(name: &str) -> Result<Self> {
        Ok(match name {
            "index" => Command::Index,
            "group-index" => Command::GroupIndex,
            "overview" => Command::Overview,
            "export" => Command::Export,
            "create" => Command::Create,
            "audit" => Command::Audit,
            "fix" => Command::Fix,
            "rebuild" => Command::Rebuild,
            other => bail!("Unknown command: {}", other),
        })
    }
}

#[derive(Debug)]
struct Options {
    command: Command,
    path: PathBuf,
    group: Option<String>,
    range: Option<(u64, u64)>,
    flag: u8,
    active: Option<PathBuf>,
    input: Option<PathBuf>,
}

impl Options {
    fn group(&self) -> Result<&str> {
        self.group
            .as_deref()
            .ok_or_else(|| eyre!("a group must be given with -n"))
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    let command = match args[1].as_str() {
        "--help" | "-h" => {
            print_usage();
            return Ok(());
        }
        "--version" | "-v" => {
            println!("tdx-util {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        name => Command::parse(name)?,
    };

    let mut options = Options {
        command,
        path: PathBuf::from("."),
        group: None,
        range: None,
        flag: b'y',
        active: None,
        input: None,
    };

    let mut i = 2;
    while i < args.len() {
        let arg = args[i].as_str();
        let mut value = || -> Result<String> {
            i += 1;
            args.get(i)
                .cloned()
                .ok_or_else(|| eyre!("Option {} requires a value", arg))
        };
        match arg {
            "-p" | "--path" => options.path = PathBuf::from(value()?),
            "-n" | "--group" => options.group = Some(value()?),
            "-a" | "--articles" => options.range = Some(parse_range(&value()?)?),
            "-f" | "--flag" => {
                let flag = value()?;
                options.flag = match flag.as_bytes() {
                    [b] if b.is_ascii_graphic() => *b,
                    _ => bail!("Invalid flag: {}", flag),
                };
            }
            "--active" => options.active = Some(PathBuf::from(value()?)),
            "-i" | "--input" => options.input = Some(PathBuf::from(value()?)),
            other => bail!("Unknown option: {}", other),
        }
        i += 1;
    }

    match options.command {
        Command::Index => dump_index(&options),
        Command::GroupIndex => dump_group_index(&options),
        Command::Overview => dump_overview(&options, false),
        Command::Export => dump_overview(&options, true),
        Command::Create => create_group(&options),
        Command::Audit => audit(&options, false),
        Command::Fix => audit(&options, true),
        Command::Rebuild => rebuild(&options),
    }
}

/// Parses `N`, `N-M`, `N-`, or `-M`. Zero stands for "the group's water mark".
fn parse_range(text: &str) -> Result<(u64, u64)> {
    let number = |s: &str| -> Result<u64> {
        if s.is_empty() {
            return Ok(0);
        }
        s.parse::<u64>()
            .wrap_err_with(|| format!("Invalid article range: {}", text))
    };
    match text.split_once('-') {
        None => {
            let n = number(text)?;
            if n == 0 {
                bail!("Invalid article range: {}", text);
            }
            Ok((n, n))
        }
        Some((low, high)) => {
            let (low, high) = (number(low)?, number(high)?);
            if high != 0 && low > high {
                bail!("Invalid article range: {}", text);
            }
            Ok((low, high))
        }
    }
}

fn open(options: &Options, mode: OpenMode) -> Result<Tradindexed> {
    Tradindexed::builder()
        .path(&options.path)
        .open(mode)
        .wrap_err_with(|| format!("cannot open overview in {}", options.path.display()))
}

fn read_active(options: &Options) -> Result<Option<Vec<ActiveGroup>>> {
    match &options.active {
        Some(path) => {
            let file = File::open(path)
                .wrap_err_with(|| format!("cannot open active file {}", path.display()))?;
            Ok(Some(parse_active(BufReader::new(file))?))
        }
        None => Ok(None),
    }
}

fn dump_index(options: &Options) -> Result<()> {
    let overview = open(options, OpenMode::Read)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();

    if let Some(group) = &options.group {
        return overview.with_index(|index| match index.lookup(group)? {
            Some((_, entry)) => print_entry(&mut out, group, &entry),
            None => bail!("cannot find group {}", group),
        });
    }

    let names: Vec<String> = read_active(options)?
        .unwrap_or_default()
        .into_iter()
        .map(|group| group.name)
        .collect();
    overview.with_index(|index| index.dump(&mut out, &names))
}

fn dump_group_index(options: &Options) -> Result<()> {
    let group = options.group()?;
    let overview = open(options, OpenMode::Read)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();

    overview.with_index(|index| {
        let (loc, _) = index
            .lookup(group)?
            .ok_or_else(|| eyre!("cannot find group {}", group))?;
        let mut data: GroupData = index
            .open_data(group, loc)
            .wrap_err_with(|| format!("cannot open group {}", group))?;
        data.index_dump(&mut out)
    })
}

fn dump_overview(options: &Options, export: bool) -> Result<()> {
    let group = options.group()?;
    let overview = open(options, OpenMode::Read)?;
    let stats = overview
        .group_stats(group)?
        .ok_or_else(|| eyre!("cannot find group {}", group))?;

    let (mut low, mut high) = options.range.unwrap_or((0, 0));
    if low == 0 {
        low = stats.low;
    }
    if high == 0 {
        high = stats.high;
    }

    let search = match overview.open_search(group, low, high)? {
        Some(search) => search,
        None if low == high => {
            println!("Article not found");
            return Ok(());
        }
        None => {
            warn!(group, low, high, "cannot open search");
            return Ok(());
        }
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for article in search {
        let line = article
            .overview
            .strip_suffix(b"\r\n")
            .unwrap_or(&article.overview);
        let written = if export {
            write!(out, "{} {} {} ", article.token, article.arrived, article.expires)
                .and_then(|_| out.write_all(line))
        } else {
            out.write_all(line).and_then(|_| {
                write!(
                    out,
                    "\tArticle: {}\tToken: {}\tArrived: {}",
                    article.number, article.token, article.arrived
                )?;
                if article.expires != 0 {
                    write!(out, "\tExpires: {}", article.expires)?;
                }
                Ok(())
            })
        };
        written
            .and_then(|_| writeln!(out))
            .wrap_err_with(|| format!("cannot write {}:{}", group, article.number))?;
    }
    Ok(())
}

fn create_group(options: &Options) -> Result<()> {
    let group = options.group()?;
    let (low, high) = options.range.unwrap_or((0, 0));
    let overview = open(options, OpenMode::ReadWrite)?;
    overview
        .group_add(group, low, high, options.flag)
        .wrap_err_with(|| format!("cannot create group {}", group))
}

fn audit(options: &Options, fix: bool) -> Result<()> {
    let active = read_active(options)?;
    let mode = if fix { OpenMode::ReadWrite } else { OpenMode::Read };
    let overview = open(options, mode)?;

    let report = overview.with_index(|index| index.audit(fix, active.as_deref()))?;
    for finding in &report.findings {
        println!("{}", finding);
    }
    if report.is_clean() {
        println!("No problems found");
    } else if fix {
        println!("{} problems found and repaired", report.findings.len());
    } else {
        println!("{} problems found", report.findings.len());
    }
    Ok(())
}

fn rebuild(options: &Options) -> Result<()> {
    let group = options.group()?;
    let input = options
        .input
        .as_ref()
        .ok_or_else(|| eyre!("an import file must be given with -i"))?;
    let file =
        File::open(input).wrap_err_with(|| format!("cannot open {}", input.display()))?;

    let mut articles = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.wrap_err_with(|| format!("cannot read {}", input.display()))?;
        if line.is_empty() {
            continue;
        }
        let article = parse_import_line(&line)
            .wrap_err_with(|| format!("{}:{}", input.display(), lineno + 1))?;
        articles.push(article);
    }

    let overview = open(options, OpenMode::ReadWrite)?;
    let stats = overview
        .rebuild_group(group, articles)
        .wrap_err_with(|| format!("cannot rebuild group {}", group))?;
    println!(
        "{}: {} articles, low {} high {}",
        group, stats.count, stats.low, stats.high
    );
    Ok(())
}

/// Parses one export line back into an article.
fn parse_import_line(line: &str) -> Result<Article> {
    let mut fields = line.splitn(4, ' ');
    let (token, arrived, expires, overview) =
        match (fields.next(), fields.next(), fields.next(), fields.next()) {
            (Some(t), Some(a), Some(e), Some(o)) => (t, a, e, o),
            _ => bail!("malformed import line"),
        };

    let token = Token::from_text(token)?;
    let arrived = arrived
        .parse::<i64>()
        .wrap_err_with(|| format!("invalid arrival time: {}", arrived))?;
    let expires = expires
        .parse::<i64>()
        .wrap_err_with(|| format!("invalid expiration time: {}", expires))?;
    let number = overview
        .split('\t')
        .next()
        .and_then(|n| n.parse::<u64>().ok())
        .filter(|&n| n > 0)
        .ok_or_else(|| eyre!("overview does not start with an article number"))?;

    let mut bytes = overview.as_bytes().to_vec();
    bytes.extend_from_slice(b"\r\n");
    Ok(Article {
        number,
        overview: bytes,
        token,
        arrived,
        expires,
    })
}

fn print_usage() {
    println!("tdx-util - tradindexed overview maintenance");
    println!();
    println!("USAGE:");
    println!("    tdx-util <COMMAND> [OPTIONS]");
    println!();
    println!("COMMANDS:");
    println!("    index          Dump the group index, or one entry with -n");
    println!("    group-index    Dump the IDX slots of the group given with -n");
    println!("    overview       Dump overview records of a group");
    println!("    export         Dump overview records in import format");
    println!("    create         Create the group given with -n");
    println!("    audit          Check the overview for problems");
    println!("    fix            Check the overview and repair problems");
    println!("    rebuild        Replace a group's data from an import file");
    println!();
    println!("OPTIONS:");
    println!("    -p, --path <DIR>       Overview directory (default: .)");
    println!("    -n, --group <NAME>     Newsgroup");
    println!("    -a, --articles <RANGE> Article range: N, N-M, N-, -M");
    println!("    -f, --flag <CHAR>      Group status flag for create (default: y)");
    println!("        --active <FILE>    Active file for names and membership checks");
    println!("    -i, --input <FILE>     Import file for rebuild");
    println!("    -h, --help             Print help information");
    println!("    -v, --version          Print version information");
}
