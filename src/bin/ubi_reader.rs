//! Inspect a raw flash dump and pull the UBI volumes out of it.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use std::fs::{self, File};
use std::io;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use ubi_reader::{
    image::{guess_peb_size, guess_start_offset},
    ubi::{Image, ScanConfig, Ubi, Volume},
};

#[derive(Args, Debug)]
struct ImageOptions {
    /// Path to the flash image
    path: PathBuf,

    /// Size of a PEB in bytes; guessed from the image if not given
    #[clap(short, long)]
    peb_size: Option<NonZeroU32>,

    /// Where in the image UBI begins; guessed from the image if not given
    #[clap(short, long)]
    start_offset: Option<u64>,

    /// Where in the image UBI ends
    #[clap(short = 'n', long)]
    end_offset: Option<u64>,

    /// Use blocks with damaged headers or data instead of leaving them out
    #[clap(long)]
    ignore_block_errors: bool,
}

impl ImageOptions {
    fn open(&self) -> Result<Ubi<File>> {
        let file = File::open(&self.path)
            .with_context(|| format!("could not open {}", self.path.display()))?;

        let start_offset = match self.start_offset {
            Some(offset) => offset,
            None => guess_start_offset(&file)?.context("no UBI blocks found in the image")?,
        };

        let peb_size = match self.peb_size {
            Some(size) => size,
            None => guess_peb_size(&file)?
                .and_then(|x| u32::try_from(x).ok())
                .and_then(NonZeroU32::new)
                .context("could not determine the PEB size; try --peb-size")?,
        };

        let mut config = ScanConfig::new(peb_size)
            .start_offset(start_offset)
            .ignore_block_errors(self.ignore_block_errors);
        if let Some(offset) = self.end_offset {
            config = config.end_offset(offset);
        }

        Ubi::open(file, &config)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every PEB found, then every image and its volumes
    Overview,

    /// Write the contents of every volume to a file
    Extract {
        /// Where to put the volumes; must be empty or not exist yet
        #[clap(short, long)]
        output_dir: PathBuf,
    },
}

/// One-line summary of a volume, with any problems found with it
fn describe(volume: &Volume) -> String {
    let mut line = format!(
        "{:3} {:?} ({:?}): {} LEB(s) of {} bytes",
        volume.vol_id(),
        volume.name(),
        volume.vol_type(),
        volume.lebs().len(),
        volume.leb_size(),
    );
    if let Some(record) = volume.record() {
        line += &format!(", {} reserved", record.reserved_pebs);
    }
    if let Some(size) = volume.data_size() {
        line += &format!(", {size} bytes of data");
    }

    for (flag, label) in [
        (volume.is_orphan(), "orphan"),
        (volume.is_incomplete(), "incomplete"),
        (volume.is_degraded(), "degraded"),
    ] {
        if flag {
            line += &format!(" [{label}]");
        }
    }
    line
}

fn create_output_dir(path: &Path) -> Result<()> {
    if path.exists() {
        if fs::read_dir(path)?.next().is_some() {
            bail!("output directory {} is not empty", path.display());
        }
    } else {
        fs::create_dir_all(path)
            .with_context(|| format!("could not create {}", path.display()))?;
    }

    Ok(())
}

/// Create the output file of a volume. Returns `None` if the file already exists, which happens
/// when two volumes of an image share a name.
fn create_volume_file(path: &Path) -> Result<Option<File>> {
    match File::options().write(true).create_new(true).open(path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(e).with_context(|| format!("could not create {}", path.display())),
    }
}

fn extract_image(ubi: &Ubi<File>, image: &Image, output_dir: &Path) -> Result<()> {
    let image_dir = output_dir.join(image.image_seq().to_string());
    fs::create_dir_all(&image_dir)
        .with_context(|| format!("could not create {}", image_dir.display()))?;

    for volume in image.volumes().values() {
        let path = image_dir.join(format!("{}.ubivol", volume.name().replace('/', "_")));
        let Some(mut out) = create_volume_file(&path)? else {
            eprintln!(
                "Skipping volume {} ({:?}): {} was already written by another volume",
                volume.vol_id(),
                volume.name(),
                path.display()
            );
            continue;
        };

        let written = io::copy(&mut ubi.volume_file(volume), &mut out)
            .with_context(|| format!("could not extract volume {:?}", volume.name()))?;
        println!("{} => {} ({written} bytes)", volume.name(), path.display());
    }

    Ok(())
}

impl Command {
    fn execute(self, ubi: &Ubi<File>) -> Result<()> {
        match self {
            Command::Overview => {
                for (peb, block) in ubi.blocks() {
                    println!("{peb:4} => {block}");
                }
                println!(
                    "{:#x} bytes of dead space, {:#x} of them before the first block",
                    ubi.scan().dead_space,
                    ubi.scan().leading_dead_space,
                );

                for image in ubi.images() {
                    println!();
                    print!("Image {:#010x}: PEB size {}", image.image_seq(), image.peb_size());
                    match image.layout_peb() {
                        Some(peb) => println!(", volume table in PEB {peb}"),
                        None => println!(", no volume table"),
                    }
                    for volume in image.volumes().values() {
                        println!("  {}", describe(volume));
                    }
                }
            }

            Command::Extract { output_dir } => {
                if ubi.images().is_empty() {
                    bail!("no UBI images found");
                }

                create_output_dir(&output_dir)?;
                for image in ubi.images() {
                    extract_image(ubi, image, &output_dir)?;
                }
            }
        };

        Ok(())
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The image to read
    #[clap(flatten)]
    image: ImageOptions,

    /// What to do with it
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    howudoin::init(howudoin::consumers::TermLine::default());

    let result = args.image.open().and_then(|ubi| args.cmd.execute(&ubi));

    howudoin::disable();
    thread::sleep(Duration::from_millis(10)); // Give howudoin time to shut down
    result
}

#[test]
fn test_create_volume_file() -> Result<()> {
    use std::io::{Read, Write};

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("vol_5.ubivol");

    let mut first = create_volume_file(&path)?.context("first volume file not created")?;
    first.write_all(b"first")?;

    // A second volume of the same name must not clobber the first
    assert!(create_volume_file(&path)?.is_none());

    let mut content = String::new();
    File::open(&path)?.read_to_string(&mut content)?;
    assert_eq!(content, "first");

    assert!(create_volume_file(&dir.path().join("missing/x.ubivol")).is_err());
    Ok(())
}
