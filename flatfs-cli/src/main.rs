#[macro_use]
extern crate log;

mod logger;

use std::io::Write;
use std::process;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use flatfs::io::FileBlockEmulator;
use flatfs::{FsError, StorageEngine, BLOCK_SIZE};

type Engine = StorageEngine<FileBlockEmulator>;

fn app() -> App<'static, 'static> {
    let path = Arg::with_name("path")
        .required(true)
        .help("Path inside the image, e.g. /notes.txt");
    let mode = |default: &'static str| {
        Arg::with_name("mode")
            .long("mode")
            .short("m")
            .takes_value(true)
            .default_value(default)
            .help("Permission bits in octal")
    };

    App::new("flatfs")
        .about("Inspect and edit a flatfs backing image")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("Log more, repeat for debug output"),
        )
        .arg(
            Arg::with_name("image")
                .required(true)
                .help("Backing image, created if missing"),
        )
        .subcommand(SubCommand::with_name("stat").arg(path.clone()))
        .subcommand(
            SubCommand::with_name("ls").arg(
                Arg::with_name("path")
                    .default_value("/")
                    .help("Directory to list"),
            ),
        )
        .subcommand(SubCommand::with_name("cat").arg(path.clone()))
        .subcommand(
            SubCommand::with_name("write")
                .arg(path.clone())
                .arg(Arg::with_name("data").required(true).help("Bytes to write"))
                .arg(
                    Arg::with_name("offset")
                        .long("offset")
                        .short("o")
                        .takes_value(true)
                        .default_value("0")
                        .help("Byte offset to write at"),
                ),
        )
        .subcommand(
            SubCommand::with_name("truncate")
                .arg(path.clone())
                .arg(Arg::with_name("size").required(true).help("New size in bytes")),
        )
        .subcommand(
            SubCommand::with_name("touch")
                .arg(path.clone())
                .arg(mode("644")),
        )
        .subcommand(SubCommand::with_name("rm").arg(path.clone()))
        .subcommand(
            SubCommand::with_name("mkdir")
                .arg(path.clone())
                .arg(mode("755")),
        )
        .subcommand(SubCommand::with_name("rmdir").arg(path))
}

pub fn main() {
    let matches = app().get_matches();
    logger::init(matches.occurrences_of("verbose"));

    let image = matches.value_of("image").unwrap_or_default();
    let mut fs = match Engine::open_path(image) {
        Ok(fs) => fs,
        Err(e) => {
            error!("Failed to initialize storage from {}: {}", image, e);
            process::exit(1);
        }
    };

    let result = match matches.subcommand() {
        (name, Some(args)) => dispatch(&mut fs, name, args),
        _ => Ok(()),
    };
    let flushed = fs.shutdown();

    let mut code = 0;
    if let Err(e) = result {
        eprintln!("flatfs: {} ({})", e, e.errno());
        code = 1;
    }
    if let Err(e) = flushed {
        error!("Failed to flush {}: {}", image, e);
        code = 1;
    }
    process::exit(code);
}

/// Runs one filesystem call, the way a mounted dispatcher would for a single request.
fn dispatch(fs: &mut Engine, name: &str, args: &ArgMatches) -> Result<(), FsError> {
    let path = args.value_of("path").unwrap_or("/");
    let rv = match name {
        "stat" => {
            let st = fs.stat(path)?;
            println!(
                "inode {}\nmode {:o}\nsize {}\nlinks {}\nuid {}",
                st.inum, st.mode, st.size, st.refs, st.uid
            );
            Ok(())
        }
        "ls" => {
            for entry in fs.list(path)? {
                println!("{}", entry);
            }
            Ok(())
        }
        "cat" => {
            let mut buf = vec![0; BLOCK_SIZE];
            let n = fs.read(path, &mut buf, 0)?;
            std::io::stdout().write_all(&buf[..n])?;
            Ok(())
        }
        "write" => {
            let data = args.value_of("data").unwrap_or_default();
            let offset = parse_number(args.value_of("offset"), 10)?;
            let n = fs.write(path, data.as_bytes(), offset as usize)?;
            info!("Wrote {} bytes to {}.", n, path);
            Ok(())
        }
        "truncate" => {
            let size = parse_number(args.value_of("size"), 10)?;
            fs.truncate(path, size as usize)
        }
        "touch" => fs.create(path, parse_number(args.value_of("mode"), 8)?),
        "rm" => fs.remove(path),
        "mkdir" => fs.make_directory(path, parse_number(args.value_of("mode"), 8)?),
        "rmdir" => fs.remove_directory(path),
        other => Err(FsError::InvalidArgument(format!("unknown command {}", other))),
    };
    debug!("{}({}) -> {:?}", name, path, rv.as_ref().map_err(FsError::errno));
    rv
}

fn parse_number(value: Option<&str>, radix: u32) -> Result<u32, FsError> {
    let value = value.unwrap_or("0");
    u32::from_str_radix(value, radix)
        .map_err(|e| FsError::InvalidArgument(format!("{:?}: {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_parse_as_octal() {
        assert_eq!(parse_number(Some("644"), 8).unwrap(), 0o644);
        assert!(matches!(
            parse_number(Some("9"), 8),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn subcommands_take_their_arguments() {
        let m = app()
            .get_matches_from_safe(vec!["flatfs", "-vv", "disk.img", "write", "/f", "hi", "-o", "3"])
            .unwrap();
        assert_eq!(m.occurrences_of("verbose"), 2);
        assert_eq!(m.value_of("image"), Some("disk.img"));
        let (name, args) = m.subcommand();
        assert_eq!(name, "write");
        let args = args.unwrap();
        assert_eq!(args.value_of("data"), Some("hi"));
        assert_eq!(args.value_of("offset"), Some("3"));
    }

    #[test]
    fn ls_defaults_to_root() {
        let m = app()
            .get_matches_from_safe(vec!["flatfs", "disk.img", "ls"])
            .unwrap();
        let args = m.subcommand_matches("ls").unwrap();
        assert_eq!(args.value_of("path"), Some("/"));
    }
}
