//! The CLI for rpm-toolkit
//!
//! Use cases:
//! $ rpmtk list [-a] <RPM>...
//! $ rpmtk head [-c <N>] <RPM>...

use std::path::Path;
use std::process::ExitCode;

use clap::{Command, arg, ArgMatches};

use rpmtk::payload::{PayloadReader, ReadResult};


fn main() -> ExitCode {

    let matches = Command::new("rpmtk")
        .version("0.1.0")
        .about("RPM Toolkit is a command line utility for inspecting the cpio payload of RPM package files")
        .disable_help_subcommand(true)
        .arg_required_else_help(true)
        .subcommand_required(true)
        .subcommand(Command::new("list")
            .about("List the payload entries of the given packages")
            .arg(arg!(all: -a --all "Also list files missing from the archive, restored from the header"))
            .arg(arg!(files: <RPM>... "The package files to list")))
        .subcommand(Command::new("head")
            .about("Show the leading bytes of every packaged regular file")
            .arg(arg!(count: -c --count [N] "Number of leading bytes to show").default_value("4"))
            .arg(arg!(files: <RPM>... "The package files to read")))
        .get_matches();

    match matches.subcommand() {
        Some(("list", matches)) => cmd_list(matches),
        Some(("head", matches)) => cmd_head(matches),
        _ => unreachable!()
    }

}


fn cmd_list(matches: &ArgMatches) -> ExitCode {
    let all = matches.get_flag("all");
    for file in matches.get_many::<String>("files").unwrap() {
        if let Err(e) = list_package(file, all) {
            return fail(file, &e);
        }
    }
    ExitCode::SUCCESS
}

fn cmd_head(matches: &ArgMatches) -> ExitCode {
    let count = matches.get_one::<String>("count").unwrap();
    let Ok(count @ 1..) = count.parse::<usize>() else {
        eprintln!("rpmtk: invalid byte count: {count}");
        return ExitCode::from(2);
    };
    for file in matches.get_many::<String>("files").unwrap() {
        if let Err(e) = head_package(file, count) {
            return fail(file, &e);
        }
    }
    ExitCode::SUCCESS
}

/// Report an error for the given package, naming it by basename like rpm
/// tools do, and exit with a status distinguishable from the tool's usage
/// errors.
fn fail(file: &str, e: &rpmtk::payload::ReadError) -> ExitCode {
    let bname = Path::new(file).file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.to_string());
    eprintln!("rpmtk: {bname}: {e}");
    ExitCode::from(128)
}

/// Print one line per entry: mode, ownership, size and filename.
fn list_package(file: &str, all: bool) -> ReadResult<()> {

    let mut reader = PayloadReader::open(file, all)?;
    let mut target = [0u8; 4097];

    while let Some(ent) = reader.next()? {

        let index = ent.index;
        let mode = mode_string(ent.mode);
        let size = ent.size;
        let packaged = ent.packaged;
        let symlink = ent.is_symlink();
        let name = ent.fname_lossy().into_owned();

        // Only root / non-root ownership is recorded for payload files.
        let (root_user, root_group) = reader.header().file_root_owner(index).unwrap();
        let user = if root_user { "root" } else { "-" };
        let group = if root_group { "root" } else { "-" };

        print!("{mode} {user:<4} {group:<4} {size:>9} {name}");
        if symlink && packaged {
            let len = reader.readlink(&mut target)?;
            print!(" -> {}", String::from_utf8_lossy(&target[..len]));
        }
        if !packaged {
            print!(" (not packaged)");
        }
        println!();

    }

    Ok(())

}

/// Print the leading bytes of every regular file of at least that size,
/// one line per file.
fn head_package(file: &str, count: usize) -> ReadResult<()> {

    let mut reader = PayloadReader::open(file, false)?;
    let mut buf = vec![0u8; count];

    while let Some(ent) = reader.next()? {

        let keep = ent.is_reg() && ent.size >= count as u64;
        let name = ent.fname_lossy().into_owned();
        if !keep {
            continue;
        }

        reader.read(&mut buf)?;
        for &byte in &buf {
            if byte.is_ascii_graphic() || byte == b' ' {
                print!(" {} ", byte as char);
            } else {
                print!("{byte:02x} ");
            }
        }
        println!(" {name}");

    }

    Ok(())

}

/// Render a mode like ls -l does, without the setuid/sticky subtleties.
fn mode_string(mode: u16) -> String {
    let mut s = String::with_capacity(10);
    s.push(match mode >> 12 {
        0x4 => 'd',
        0xA => 'l',
        0x8 => '-',
        0x2 => 'c',
        0x6 => 'b',
        0x1 => 'p',
        0xC => 's',
        _ => '?',
    });
    for shift in [6u16, 3, 0] {
        let bits = mode >> shift;
        s.push(if bits & 0x4 != 0 { 'r' } else { '-' });
        s.push(if bits & 0x2 != 0 { 'w' } else { '-' });
        s.push(if bits & 0x1 != 0 { 'x' } else { '-' });
    }
    s
}
