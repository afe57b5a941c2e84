//! Interactive command shell over an ELFS filesystem.
//!
//! The binary connects to a backend with the key, IV, and path given on
//! the command line, then reads commands from stdin. Only `create` and
//! `login` are available before a user has logged in.

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;

use elfs::dirent::{Dirent, DirentId};
use elfs::identity::{GroupId, Permission, User, UserId, PASSWORD_HASH_SIZE};
use elfs::Driver;
use elfs::DriverError;

/// Interactive shell over an encrypted ELFS filesystem
#[derive(Parser)]
#[command(name = "elfs")]
#[command(author, version)]
struct Cli {
    /// The encryption key in hex (16 bytes)
    #[arg(long)]
    key: String,

    /// The base IV in hex (16 bytes)
    #[arg(long)]
    iv: String,

    /// The connector type
    #[arg(long = "type", value_enum, default_value = "local")]
    connector: ConnectorType,

    /// The path to the filesystem backend
    #[arg(long)]
    path: PathBuf,

    /// Force the connection over a stale lock
    #[arg(long)]
    force: bool,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ConnectorType {
    #[value(name = "local")]
    Local,
    #[value(name = "S3", alias = "s3")]
    S3,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn sha_hash(password: &str) -> [u8; PASSWORD_HASH_SIZE] {
    Sha256::digest(password.as_bytes()).into()
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let key = hex::decode(&cli.key).context("could not decode hex key")?;
    let iv = hex::decode(&cli.iv).context("could not decode hex IV")?;

    if cli.connector == ConnectorType::S3 {
        bail!("the S3 connector is not part of this build; use --type local");
    }
    let driver = Driver::open_local(&key, &iv, &cli.path, cli.force)
        .context("failed to attach to the backend")?;

    match driver.sync_from_disk() {
        Ok(()) => {}
        Err(DriverError::NotFound { what, .. }) if what == "metadata blob" => {
            println!("No filesystem found on this backend; run `create <root password>`.");
        }
        Err(e) => {
            let _ = driver.close();
            return Err(e).context("failed to load the filesystem");
        }
    }

    let mut active_user: Option<User> = None;
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        match &active_user {
            Some(user) => print!("{} > ", user.name),
            None => print!("> "),
        }
        io::stdout().flush()?;

        let line = match lines.next() {
            Some(line) => line?,
            None => break,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" {
            break;
        }

        match run_command(&driver, &mut active_user, line) {
            Ok(()) => {}
            Err(e) => {
                println!("Failed to run command: {e:#}");
            }
        }
    }
    println!();

    driver.close().context("failed to close the filesystem")?;
    Ok(())
}

fn run_command(driver: &Driver, active_user: &mut Option<User>, line: &str) -> Result<()> {
    let args = split_command_line(line)?;
    let (command, args) = match args.split_first() {
        Some((command, args)) => (command.as_str(), args),
        None => return Ok(()),
    };

    match command {
        "create" => create(driver, args),
        "login" => login(driver, active_user, args),
        other => {
            let Some(user) = active_user.as_ref() else {
                bail!("need to login");
            };
            let user = user.clone();
            match other {
                "help" => help(),
                "cat" => cat(driver, &user, args),
                "ls" => ls(driver, &user, args),
                "mkdir" => mkdir(driver, &user, args),
                "import" => import(driver, &user, args),
                "export" => export(driver, &user, args),
                "mv" => mv(driver, &user, args),
                "rename" => rename(driver, &user, args),
                "rm" => rm(driver, &user, args),
                "chown" => chown(driver, &user, args),
                "permadd" => permadd(driver, &user, args),
                "permdel" => permdel(driver, &user, args),
                "useradd" => useradd(driver, &user, args),
                "userdel" => userdel(driver, &user, args),
                "userlist" => userlist(driver, args),
                "grouplist" => grouplist(driver, args),
                "groupadd" => groupadd(driver, &user, args),
                "groupdel" => groupdel(driver, &user, args),
                "groupjoin" => groupjoin(driver, &user, args),
                "groupkick" => groupkick(driver, &user, args),
                "promote" => promote(driver, &user, args),
                "demote" => demote(driver, &user, args),
                _ => bail!("unknown operation: {other}"),
            }
        }
    }
}

/// Split a command line into arguments, honoring single and double quotes.
fn split_command_line(line: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if quote.is_some() {
        bail!("unterminated quote in command");
    }
    if in_word {
        args.push(current);
    }
    Ok(args)
}

fn parse_dirent_id(arg: &str) -> DirentId {
    DirentId::from(arg)
}

fn parse_user_id(arg: &str) -> Result<UserId> {
    arg.parse().with_context(|| format!("bad user id: {arg}"))
}

fn parse_group_id(arg: &str) -> Result<GroupId> {
    arg.parse().with_context(|| format!("bad group id: {arg}"))
}

fn optional_parent(args: &[String], index: usize) -> DirentId {
    args.get(index)
        .map(|arg| parse_dirent_id(arg))
        .unwrap_or_else(DirentId::root)
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn create(driver: &Driver, args: &[String]) -> Result<()> {
    if args.len() != 1 {
        bail!("USAGE: create <root password>");
    }
    driver.create_filesystem(sha_hash(&args[0]))?;
    println!("filesystem created");
    Ok(())
}

fn login(driver: &Driver, active_user: &mut Option<User>, args: &[String]) -> Result<()> {
    if args.len() != 2 {
        bail!("USAGE: login <username> <password>");
    }
    let user = driver.user_auth(&args[0], &sha_hash(&args[1]))?;
    *active_user = Some(user);
    Ok(())
}

fn help() -> Result<()> {
    println!(
        "commands: create login useradd userdel userlist groupadd groupdel groupjoin \
         groupkick promote demote grouplist ls mkdir import export cat mv rename \
         rm chown permadd permdel quit"
    );
    Ok(())
}

fn cat(driver: &Driver, user: &User, args: &[String]) -> Result<()> {
    if args.is_empty() {
        bail!("USAGE: cat <file> ...");
    }
    let mut stdout = io::stdout().lock();
    for arg in args {
        let mut reader = driver.read(user.id, &parse_dirent_id(arg))?;
        io::copy(&mut reader, &mut stdout)
            .with_context(|| format!("failed to read fs file {arg}"))?;
        writeln!(stdout)?;
    }
    Ok(())
}

fn ls(driver: &Driver, user: &User, args: &[String]) -> Result<()> {
    if args.len() > 1 {
        bail!("USAGE: ls [dir id]");
    }
    let id = optional_parent(args, 0);

    for entry in driver.list(user.id, &id)? {
        println!("{}", format_entry(&entry));
    }
    Ok(())
}

fn format_entry(entry: &Dirent) -> String {
    let kind = if entry.is_file() { "F" } else { "D" };
    let md5 = entry
        .content_md5()
        .map(hex::encode)
        .unwrap_or_else(|| "-".to_string());

    let mut groups: Vec<String> = entry
        .group_permissions
        .iter()
        .map(|(group, permission)| {
            let read = if permission.read { "R" } else { "-" };
            let write = if permission.write { "W" } else { "-" };
            format!("{group}: {read}{write}")
        })
        .collect();
    groups.sort();

    format!(
        "{}\t{}\t{}\t{}\t{}\t{}\t[{}]",
        entry.name,
        kind,
        entry.id,
        entry.size(),
        entry.mod_timestamp,
        md5,
        groups.join(", ")
    )
}

fn mkdir(driver: &Driver, user: &User, args: &[String]) -> Result<()> {
    if args.is_empty() || args.len() > 2 {
        bail!("USAGE: mkdir <dir name> [parent id]");
    }
    let parent = optional_parent(args, 1);
    let id = driver.make_dir(user.id, &args[0], &parent, HashMap::new())?;
    println!("{id}");
    Ok(())
}

fn import(driver: &Driver, user: &User, args: &[String]) -> Result<()> {
    if args.is_empty() || args.len() > 2 {
        bail!("USAGE: import <external path> [parent id]");
    }
    let parent = optional_parent(args, 1);
    import_path(driver, user, Path::new(&args[0]), &parent)
}

fn import_path(driver: &Driver, user: &User, path: &Path, parent: &DirentId) -> Result<()> {
    let file_name = path
        .file_name()
        .with_context(|| format!("no file name in path {}", path.display()))?
        .to_string_lossy()
        .to_string();

    let info = fs::metadata(path).with_context(|| path.display().to_string())?;
    if !info.is_dir() {
        let mut file = File::open(path).with_context(|| path.display().to_string())?;
        driver
            .put(user.id, &file_name, &mut file, HashMap::new(), parent)
            .with_context(|| path.display().to_string())?;
        return Ok(());
    }

    // Make the directory first, then import its children into it.
    let new_id = driver
        .make_dir(user.id, &file_name, parent, HashMap::new())
        .with_context(|| path.display().to_string())?;
    for child in fs::read_dir(path).with_context(|| path.display().to_string())? {
        import_path(driver, user, &child?.path(), &new_id)?;
    }
    Ok(())
}

fn export(driver: &Driver, user: &User, args: &[String]) -> Result<()> {
    if args.len() != 2 {
        bail!("USAGE: export <file> <external path>");
    }
    let source = parse_dirent_id(&args[0]);
    let mut dest = PathBuf::from(&args[1]);

    let info = driver.get_dirent(user.id, &source)?;
    if !info.is_file() {
        bail!("recursive export is not supported");
    }

    // Exporting onto a directory drops the file inside it, keeping its name.
    if dest.is_dir() {
        dest.push(&info.name);
    }

    let mut out = File::create(&dest).with_context(|| dest.display().to_string())?;
    let mut reader = driver.read(user.id, &source)?;
    io::copy(&mut reader, &mut out).with_context(|| dest.display().to_string())?;
    Ok(())
}

fn mv(driver: &Driver, user: &User, args: &[String]) -> Result<()> {
    if args.len() != 2 {
        bail!("USAGE: mv <target id> <new parent id>");
    }
    driver.move_dirent(user.id, &parse_dirent_id(&args[0]), &parse_dirent_id(&args[1]))?;
    Ok(())
}

fn rename(driver: &Driver, user: &User, args: &[String]) -> Result<()> {
    if args.len() != 2 {
        bail!("USAGE: rename <target id> <new name>");
    }
    driver.rename(user.id, &parse_dirent_id(&args[0]), &args[1])?;
    Ok(())
}

fn rm(driver: &Driver, user: &User, args: &[String]) -> Result<()> {
    let (recursive, id) = match args {
        [id] => (false, id),
        [flag, id] if flag == "-r" => (true, id),
        _ => bail!("USAGE: rm [-r] <dirent id>"),
    };

    let id = parse_dirent_id(id);
    if recursive {
        driver.remove_dir(user.id, &id)?;
    } else {
        driver.remove_file(user.id, &id)?;
    }
    Ok(())
}

fn chown(driver: &Driver, user: &User, args: &[String]) -> Result<()> {
    if args.len() != 2 {
        bail!("USAGE: chown <dirent id> <new owner id>");
    }
    driver.change_owner(user.id, &parse_dirent_id(&args[0]), parse_user_id(&args[1])?)?;
    Ok(())
}

fn permadd(driver: &Driver, user: &User, args: &[String]) -> Result<()> {
    if args.len() != 3 {
        bail!("USAGE: permadd <dirent id> <group id> <2|4|6>");
    }
    let byte: u8 = args[2]
        .parse()
        .with_context(|| format!("bad permission number: {}", args[2]))?;
    let permission = Permission::from_wire(byte)
        .with_context(|| format!("bad permission number: {byte}; use 4 for read, 2 for write, 6 for both"))?;
    driver.put_group_access(
        user.id,
        &parse_dirent_id(&args[0]),
        parse_group_id(&args[1])?,
        permission,
    )?;
    Ok(())
}

fn permdel(driver: &Driver, user: &User, args: &[String]) -> Result<()> {
    if args.len() != 2 {
        bail!("USAGE: permdel <dirent id> <group id>");
    }
    driver.remove_group_access(user.id, &parse_dirent_id(&args[0]), parse_group_id(&args[1])?)?;
    Ok(())
}

fn useradd(driver: &Driver, user: &User, args: &[String]) -> Result<()> {
    if args.len() != 2 {
        bail!("USAGE: useradd <username> <password>");
    }
    let id = driver.add_user(user.id, &args[0], sha_hash(&args[1]))?;
    println!("{id}");
    Ok(())
}

fn userdel(driver: &Driver, user: &User, args: &[String]) -> Result<()> {
    if args.len() != 1 {
        bail!("USAGE: userdel <user id>");
    }
    driver.remove_user(user.id, parse_user_id(&args[0])?)?;
    Ok(())
}

fn userlist(driver: &Driver, args: &[String]) -> Result<()> {
    if !args.is_empty() {
        bail!("USAGE: userlist");
    }
    for user in driver.users() {
        println!("{}\t{}", user.name, user.id);
    }
    Ok(())
}

fn grouplist(driver: &Driver, args: &[String]) -> Result<()> {
    if !args.is_empty() {
        bail!("USAGE: grouplist");
    }
    for group in driver.groups() {
        let mut members: Vec<UserId> = group.members.iter().copied().collect();
        members.sort_unstable();
        let members: Vec<String> = members
            .iter()
            .map(|&id| {
                if group.is_admin(id) {
                    format!("{id}*")
                } else {
                    id.to_string()
                }
            })
            .collect();
        println!("{}\t{}\t{}", group.name, group.id, members.join("\t"));
    }
    Ok(())
}

fn groupadd(driver: &Driver, user: &User, args: &[String]) -> Result<()> {
    if args.len() != 1 {
        bail!("USAGE: groupadd <group name>");
    }
    let id = driver.add_group(user.id, &args[0])?;
    println!("{id}");
    Ok(())
}

fn groupdel(driver: &Driver, user: &User, args: &[String]) -> Result<()> {
    if args.len() != 1 {
        bail!("USAGE: groupdel <group id>");
    }
    driver.delete_group(user.id, parse_group_id(&args[0])?)?;
    Ok(())
}

fn groupjoin(driver: &Driver, user: &User, args: &[String]) -> Result<()> {
    if args.len() != 2 {
        bail!("USAGE: groupjoin <group id> <user id>");
    }
    driver.join_group(user.id, parse_user_id(&args[1])?, parse_group_id(&args[0])?)?;
    Ok(())
}

fn groupkick(driver: &Driver, user: &User, args: &[String]) -> Result<()> {
    if args.len() != 2 {
        bail!("USAGE: groupkick <group id> <user id>");
    }
    driver.kick_user(user.id, parse_user_id(&args[1])?, parse_group_id(&args[0])?)?;
    Ok(())
}

fn promote(driver: &Driver, user: &User, args: &[String]) -> Result<()> {
    if args.len() != 2 {
        bail!("USAGE: promote <group id> <user id>");
    }
    driver.promote_user(user.id, parse_user_id(&args[1])?, parse_group_id(&args[0])?)?;
    Ok(())
}

fn demote(driver: &Driver, user: &User, args: &[String]) -> Result<()> {
    if args.len() != 2 {
        bail!("USAGE: demote <group id> <user id>");
    }
    driver.demote_user(user.id, parse_user_id(&args[1])?, parse_group_id(&args[0])?)?;
    Ok(())
}
