//! zvfs command-line tool.
//!
//! Builds ZIP archives and executable images, and inspects them through the
//! same ZIP backend the library mounts.
//!
//! ## Usage
//!
//! ```bash
//! zvfs mkzip app.zip ./app --strip ./app
//! zvfs mkimg app.img ./app --strip ./app --image ./stub --password hunter2
//! zvfs list app.zip --glob '*.tcl'
//! zvfs info app.zip lib/init.tcl --json
//! zvfs cat app.img lib/init.tcl
//! zvfs canonical /app lib/init.tcl
//! ```

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use zvfs_kernel::{Filesystem, ListFilter, OpenFlags, VfsConfig, ZipBuilder, ZipFs};

/// Where inspected archives are mounted.
const MOUNT_POINT: &str = "/zvfs";

/// Build and inspect zvfs archives.
#[derive(Parser, Debug)]
#[command(name = "zvfs")]
#[command(about = "Build and inspect ZIP archives for the zvfs filesystem layer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Archive every file below DIR into OUT
    Mkzip {
        out: String,
        dir: String,
        #[command(flatten)]
        build: BuildOpts,
    },

    /// Like mkzip, behind an executable prefix
    Mkimg {
        out: String,
        dir: String,
        #[command(flatten)]
        build: BuildOpts,

        /// Prefix image (defaults to this executable)
        #[arg(long)]
        image: Option<String>,
    },

    /// List entry names
    List {
        archive: String,

        /// Only names matching this glob
        #[arg(long, conflicts_with = "regexp")]
        glob: Option<String>,

        /// Only names matching this regular expression
        #[arg(long)]
        regexp: Option<String>,

        #[arg(long)]
        password: Option<String>,
    },

    /// Show where an entry lives inside its archive
    Info {
        archive: String,
        path: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,

        #[arg(long)]
        password: Option<String>,
    },

    /// Write an entry's content to stdout
    Cat {
        archive: String,
        path: String,

        #[arg(long)]
        password: Option<String>,
    },

    /// Print where PATH lands when mounted on MOUNT
    Canonical {
        /// Mount point, or the path itself when no PATH follows (the zipfs
        /// volume root is used then)
        #[arg(value_name = "MOUNT")]
        first: String,
        #[arg(value_name = "PATH")]
        second: Option<String>,
    },
}

#[derive(Args, Debug)]
struct BuildOpts {
    /// Strip this prefix from member names
    #[arg(long)]
    strip: Option<String>,

    /// Encrypt members with this password
    #[arg(long)]
    password: Option<String>,
}

fn expand(path: &str) -> PathBuf {
    shellexpand::tilde(path).as_ref().into()
}

fn builder(opts: &BuildOpts) -> Result<ZipBuilder<'static>> {
    let mut builder = ZipBuilder::new();
    if let Some(pw) = &opts.password {
        builder = builder
            .password(pw.as_bytes())
            .context("password rejected")?;
    }
    if let Some(strip) = &opts.strip {
        builder = builder.strip_prefix(strip.as_str());
    }
    Ok(builder)
}

/// Mount `archive` on [`MOUNT_POINT`] in a fresh backend.
fn open_archive(archive: &str, password: Option<&str>) -> Result<ZipFs> {
    let config = VfsConfig::load_default().context("loading config")?;
    let fs = ZipFs::with_config(config);
    let path = expand(archive);
    fs.mount(&path, MOUNT_POINT, password.map(str::as_bytes))
        .with_context(|| format!("mounting {}", path.display()))?;
    Ok(fs)
}

fn member_path(path: &str) -> String {
    format!("{MOUNT_POINT}/{}", path.trim_start_matches('/'))
}

fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Mkzip { out, dir, build } => {
            let out = expand(&out);
            builder(&build)?
                .mkzip(&out, &expand(&dir))
                .with_context(|| format!("writing {}", out.display()))?;
            tracing::info!("wrote {}", out.display());
        }
        Command::Mkimg {
            out,
            dir,
            build,
            image,
        } => {
            let out = expand(&out);
            let image = image.as_deref().map(expand);
            builder(&build)?
                .mkimg(&out, &expand(&dir), image.as_deref())
                .with_context(|| format!("writing {}", out.display()))?;
            tracing::info!("wrote {}", out.display());
        }
        Command::List {
            archive,
            glob,
            regexp,
            password,
        } => {
            let fs = open_archive(&archive, password.as_deref())?;
            let filter = match (glob, regexp) {
                (Some(g), _) => Some(ListFilter::Glob(member_path(&g))),
                (None, Some(re)) => Some(ListFilter::Regexp(re)),
                (None, None) => None,
            };
            let prefix = format!("{MOUNT_POINT}/");
            for name in fs.list(filter.as_ref())? {
                if let Some(rel) = name.strip_prefix(&prefix) {
                    println!("{rel}");
                }
            }
        }
        Command::Info {
            archive,
            path,
            json,
            password,
        } => {
            let fs = open_archive(&archive, password.as_deref())?;
            let info = fs
                .info(&member_path(&path))
                .with_context(|| format!("no entry {path}"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("{:<16} {}", "archive", info.archive);
                println!("{:<16} {}", "size", info.size);
                println!("{:<16} {}", "compressed size", info.compressed_size);
                println!("{:<16} {}", "offset", info.offset);
            }
        }
        Command::Cat {
            archive,
            path,
            password,
        } => {
            let fs = open_archive(&archive, password.as_deref())?;
            let full = member_path(&path);
            if fs.stat(&full)?.is_dir() {
                bail!("{path} is a directory");
            }
            let mut chan = fs.open(&full, OpenFlags::read(), 0)?;
            let data = chan.read_to_vec()?;
            chan.close()?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&data)?;
            stdout.flush()?;
        }
        Command::Canonical { first, second } => {
            let canonical = match second {
                Some(path) => ZipFs::canonical(Some(&first), &path)?,
                None => ZipFs::canonical(None, &first)?,
            };
            println!("{canonical}");
        }
    }

    Ok(())
}
