//! Command-line dispatch: `add`, `run`, `mv`, `rm`.
//!
//! The flow mirrors the privilege discipline the tool depends on: drop
//! the effective identity to the caller while opening caller-owned
//! resources (pid file, input fd, event socket, timing file), escalate to
//! full root for policy checks and construction, and hand a saved-root
//! path into the jail for the final drop.

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::builder::JailBuilder;
use crate::fsops::FsOps;
use crate::jaildir::JailDir;
use crate::mounts::{MountPhase, MountTable};
use crate::owner::JailOwner;
use crate::paths::{absolute, check_filename, endslash, noendslash};
use crate::policy::JailPolicy;
use crate::supervisor::{run_jail, PidFile, RunConfig, Supervisor};
use crate::types::{CallerIds, DstState, JailAction, JailError, Result, ROOT};

#[derive(Parser)]
#[command(
    name = "pa-jail",
    version,
    about = "Construct chroot jails and run untrusted code inside them"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or augment a jail from a manifest, without running anything
    #[command(alias = "init", disable_help_flag = true)]
    Add(AddArgs),
    /// Construct a jail and run a command in it as a user
    #[command(disable_help_flag = true)]
    Run(RunArgs),
    /// Safely move a jail; both sides must be allowed by policy
    Mv(MvArgs),
    /// Unmount everything under a jail and erase it
    Rm(RmArgs),
}

#[derive(Args)]
struct BuildOpts {
    /// Print actions without running them
    #[arg(short = 'n', long = "dry-run")]
    dry_run: bool,
    /// Print actions as well as running them
    #[arg(short = 'V', long)]
    verbose: bool,
    /// Populate the jail from the manifest in FILE (`-` reads stdin)
    #[arg(short = 'f', long = "manifest-file", value_name = "FILE")]
    manifest_files: Vec<String>,
    /// Populate the jail from MANIFEST text
    #[arg(short = 'F', long = "manifest", value_name = "MANIFEST")]
    manifests: Vec<String>,
    /// Hard-link new jail files against SKELDIR
    #[arg(short = 'S', long = "skeleton", value_name = "SKELDIR")]
    skeleton: Option<String>,
    /// Rewrite ownership of <JAILDIR>/home/* from the passwd database
    #[arg(short = 'h', long = "chown-home")]
    chown_home: bool,
    /// Recursively chown DIR to the jail user (repeatable)
    #[arg(short = 'u', long = "chown-user", value_name = "DIR")]
    chown_user: Vec<String>,
}

#[derive(Args)]
struct AddArgs {
    #[command(flatten)]
    build: BuildOpts,
    jaildir: String,
    user: Option<String>,
    #[arg(long, action = ArgAction::Help, help = "Print help")]
    help: Option<bool>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    build: BuildOpts,
    /// Suppress the trailing status banner
    #[arg(short = 'q', long)]
    quiet: bool,
    /// Stay in the foreground and wait for the jail
    #[arg(long = "fg")]
    foreground: bool,
    /// Kill the jail after SEC seconds of wall-clock time
    #[arg(short = 'T', long = "timeout", value_name = "SEC")]
    timeout: Option<f64>,
    /// Kill the jail after SEC seconds without I/O
    #[arg(short = 'I', long = "idle-timeout", value_name = "SEC")]
    idle_timeout: Option<f64>,
    /// Write the jail process pid to PIDFILE
    #[arg(short = 'p', long = "pid-file", value_name = "PIDFILE")]
    pid_file: Option<String>,
    /// Write STR to the pid file; `$$` becomes the pid
    #[arg(short = 'P', long = "pid-contents", value_name = "STR", default_value = "$$")]
    pid_contents: String,
    /// Use a tty, reading input from INPUT (a file or FIFO)
    #[arg(short = 'i', long = "input", value_name = "INPUT")]
    input: Option<String>,
    /// Listen on a UNIX socket for event-stream subscribers
    #[arg(long = "event-source", value_name = "SOCK")]
    event_source: Option<String>,
    /// Write STR to stdout once the jail is ready (default: newline)
    #[arg(long = "ready", value_name = "STR", num_args = 0..=1, default_missing_value = "\n")]
    ready: Option<String>,
    /// Terminal size, or `none`
    #[arg(long = "size", value_name = "WxH", default_value = "80x25")]
    size: String,
    /// Do not translate \n to \r\n in output
    #[arg(long = "no-onlcr", overrides_with = "onlcr")]
    no_onlcr: bool,
    /// Translate \n to \r\n in output (default)
    #[arg(long, overrides_with = "no_onlcr")]
    onlcr: bool,
    /// Append poll-interval timing records to FILE
    #[arg(short = 't', long = "timing-file", value_name = "FILE")]
    timing_file: Option<String>,
    jaildir: String,
    user: Option<String>,
    /// NAME=VALUE environment overrides, then the command
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
    #[arg(long, action = ArgAction::Help, help = "Print help")]
    help: Option<bool>,
}

#[derive(Args)]
struct MvArgs {
    /// Print actions without running them
    #[arg(short = 'n', long = "dry-run")]
    dry_run: bool,
    /// Print actions as well as running them
    #[arg(short = 'V', long)]
    verbose: bool,
    source: String,
    dest: String,
}

#[derive(Args)]
struct RmArgs {
    /// Print actions without running them
    #[arg(short = 'n', long = "dry-run")]
    dry_run: bool,
    /// Print actions as well as running them
    #[arg(short = 'V', long)]
    verbose: bool,
    /// Do not complain if JAILDIR does not exist
    #[arg(short = 'f', long)]
    force: bool,
    /// Detach and remove in the background (default)
    #[arg(long = "bg", overrides_with = "fg")]
    bg: bool,
    /// Remove in the foreground
    #[arg(long = "fg", overrides_with = "bg")]
    fg: bool,
    jaildir: String,
}

pub fn run() -> i32 {
    env_logger::init();
    let cli = Cli::parse();
    match dispatch(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{}", err);
            err.exit_code()
        }
    }
}

fn dispatch(command: Command) -> Result<i32> {
    match command {
        Command::Add(args) => {
            let req = Request::from_add(args);
            setup_and_go(req)
        }
        Command::Run(args) => {
            let req = Request::from_run(args);
            setup_and_go(req)
        }
        Command::Mv(args) => do_mv(args),
        Command::Rm(args) => do_rm(args),
    }
}

/// The merged shape of `add` and `run`: a `run` without a command is an
/// `add`.
struct Request {
    action: JailAction,
    build: BuildOpts,
    quiet: bool,
    foreground: bool,
    timeout: Option<f64>,
    idle_timeout: Option<f64>,
    pid_file: Option<String>,
    pid_contents: String,
    input: Option<String>,
    event_source: Option<String>,
    ready: Option<String>,
    size: String,
    no_onlcr: bool,
    timing_file: Option<String>,
    jaildir: String,
    user: Option<String>,
    command: Vec<String>,
}

impl Request {
    fn from_add(args: AddArgs) -> Self {
        Self {
            action: JailAction::Add,
            build: args.build,
            quiet: false,
            foreground: false,
            timeout: None,
            idle_timeout: None,
            pid_file: None,
            pid_contents: "$$".to_string(),
            input: None,
            event_source: None,
            ready: None,
            size: "80x25".to_string(),
            no_onlcr: false,
            timing_file: None,
            jaildir: args.jaildir,
            user: args.user,
            command: Vec::new(),
        }
    }

    fn from_run(args: RunArgs) -> Self {
        let action = if args.user.is_none() || args.command.is_empty() {
            JailAction::Add
        } else {
            JailAction::Run
        };
        Self {
            action,
            build: args.build,
            quiet: args.quiet,
            foreground: args.foreground,
            timeout: args.timeout,
            idle_timeout: args.idle_timeout,
            pid_file: args.pid_file,
            pid_contents: args.pid_contents,
            input: args.input,
            event_source: args.event_source,
            ready: args.ready,
            size: args.size,
            no_onlcr: args.no_onlcr,
            timing_file: args.timing_file,
            jaildir: args.jaildir,
            user: args.user,
            command: args.command,
        }
    }
}

fn parse_size(size: &str) -> Result<Option<(u16, u16)>> {
    if size == "none" {
        return Ok(None);
    }
    let parsed = size.split_once('x').and_then(|(w, h)| {
        let w = w.parse::<u16>().ok()?;
        let h = h.parse::<u16>().ok()?;
        (w > 0 && h > 0).then_some((w, h))
    });
    match parsed {
        Some(dims) => Ok(Some(dims)),
        None => Err(JailError::Usage(format!(
            "--size {}: expected WxH or none",
            size
        ))),
    }
}

fn read_manifests(build: &BuildOpts) -> Result<String> {
    let mut manifest = String::new();
    let mut push = |text: String| {
        manifest.push_str(&text);
        if !manifest.is_empty() && !manifest.ends_with('\n') {
            manifest.push('\n');
        }
    };
    for file in &build.manifest_files {
        if file == "-" {
            // SAFETY: isatty is harmless.
            if unsafe { libc::isatty(libc::STDIN_FILENO) } == 1 {
                return Err(JailError::Usage("stdin: Is a tty".to_string()));
            }
            let mut text = String::new();
            std::io::Read::read_to_string(&mut std::io::stdin(), &mut text)
                .map_err(JailError::io("stdin"))?;
            push(text);
        } else {
            push(std::fs::read_to_string(file).map_err(JailError::io(file.clone()))?);
        }
    }
    for text in &build.manifests {
        push(text.clone());
    }
    Ok(manifest)
}

/// Leave stdio alone but close everything else we inherited before
/// handing descriptors to the jail.
fn close_unwanted_fds() {
    // SAFETY: directory iteration over /dev/fd, closing only fds > 2.
    unsafe {
        let dir = libc::opendir(c"/dev/fd".as_ptr());
        if dir.is_null() {
            return;
        }
        let dir_fd = libc::dirfd(dir);
        loop {
            let de = libc::readdir(dir);
            if de.is_null() {
                break;
            }
            let name = std::ffi::CStr::from_ptr((*de).d_name.as_ptr());
            if let Ok(fd) = name.to_string_lossy().parse::<i32>() {
                if fd > 2 && fd != dir_fd {
                    libc::close(fd);
                }
            }
        }
        libc::closedir(dir);
    }
}

fn setup_and_go(req: Request) -> Result<i32> {
    let mut fs = FsOps::new(req.build.verbose, req.build.dry_run);
    let dryrun = req.build.dry_run;

    if req.action == JailAction::Run
        && req.foreground
        && (req.input.is_some() || req.event_source.is_some())
    {
        return Err(JailError::Usage(
            "--fg cannot relay --input or --event-source".to_string(),
        ));
    }
    let term_size = parse_size(&req.size)?;
    let manifest = read_manifests(&req.build)?;

    let owner = match &req.user {
        Some(name) => Some(JailOwner::lookup(name)?),
        None => None,
    };

    // hold the caller's identity while touching caller-owned files
    let caller = CallerIds::capture();
    if !dryrun {
        nix::unistd::seteuid(nix::unistd::Uid::from_raw(caller.uid))
            .map_err(|e| priv_err("seteuid", e))?;
        nix::unistd::setegid(nix::unistd::Gid::from_raw(caller.gid))
            .map_err(|e| priv_err("setegid", e))?;
    }

    if req.action == JailAction::Run {
        close_unwanted_fds();
    }

    let pidfile = match &req.pid_file {
        Some(name) => PidFile::open(name, &req.pid_contents, &fs)?,
        None => None,
    };

    let mut input_fd: i32 = 0;
    if let Some(path) = &req.input {
        if !dryrun {
            // a FIFO is opened read-write so writers never see EOF
            let is_fifo = std::fs::metadata(path)
                .map(|m| std::os::unix::fs::FileTypeExt::is_fifo(&m.file_type()))
                .unwrap_or(false);
            let mode = if is_fifo { libc::O_RDWR } else { libc::O_RDONLY };
            let c = crate::fsops::cstring(path)?;
            // SAFETY: c is a valid NUL-terminated path.
            input_fd = unsafe { libc::open(c.as_ptr(), mode | libc::O_CLOEXEC | libc::O_NONBLOCK) };
            if input_fd == -1 {
                return Err(JailError::last_os(path.clone()));
            }
        }
    }

    let mut event_source_fd: i32 = -1;
    if let Some(path) = &req.event_source {
        fs.echo(format_args!("socket {}", path));
        if !dryrun {
            event_source_fd = bind_event_socket(path)?;
        }
    }

    let mut timing_fd: i32 = -1;
    if let Some(path) = &req.timing_file {
        fs.echo(format_args!("touch {}", path));
        if !dryrun {
            let c = crate::fsops::cstring(path)?;
            // SAFETY: c is a valid NUL-terminated path.
            timing_fd = unsafe {
                libc::open(
                    c.as_ptr(),
                    libc::O_WRONLY | libc::O_CLOEXEC | libc::O_CREAT | libc::O_TRUNC,
                    0o666 as libc::c_uint,
                )
            };
            if timing_fd == -1 {
                return Err(JailError::last_os(path.clone()));
            }
        }
    }

    // escalate so the real uid/gid is root: construction runs system
    // binaries that must execute as root
    if !dryrun {
        nix::unistd::setresgid(
            nix::unistd::Gid::from_raw(ROOT as libc::gid_t),
            nix::unistd::Gid::from_raw(ROOT as libc::gid_t),
            nix::unistd::Gid::from_raw(ROOT as libc::gid_t),
        )
        .map_err(|e| priv_err("setresgid", e))?;
        nix::unistd::setresuid(
            nix::unistd::Uid::from_raw(ROOT),
            nix::unistd::Uid::from_raw(ROOT),
            nix::unistd::Uid::from_raw(ROOT),
        )
        .map_err(|e| priv_err("setresuid", e))?;
    }

    let policy = JailPolicy::open_system()?;
    let jaildir = JailDir::open(
        &mut fs,
        &req.jaildir,
        req.build.skeleton.as_deref(),
        req.action,
        false,
        &policy,
    )?
    .expect("non-rm walk always yields a jail directory");

    let mut mounts = MountTable::new(if req.action == JailAction::Run {
        MountPhase::PreFork
    } else {
        MountPhase::Manifest
    });

    // skeleton directory
    let mut link_dir = String::new();
    if !jaildir.skeletondir.is_empty() {
        fs.ensure_dir(&jaildir.skeletondir, 0o755, true)?;
        link_dir = noendslash(&jaildir.skeletondir);
    }

    // the user's home directory inside the jail
    if let Some(owner) = &owner {
        fs.ensure_dir(&format!("{}home", jaildir.dir), 0o755, true)?;
        let jailhome = format!("{}{}", noendslash(&jaildir.dir), owner.home);
        let created = fs.ensure_dir(&jailhome, 0o700, true)?;
        if created {
            fs.lchown(&jailhome, owner.uid, owner.gid)?;
        }
        if !link_dir.is_empty() {
            let _ = fs.ensure_dir(&format!("{}/home", link_dir), 0o755, true);
            let linkhome = format!("{}{}", link_dir, owner.home);
            if let Ok(true) = fs.ensure_dir(&linkhome, 0o700, true) {
                let _ = fs.lchown(&linkhome, owner.uid, owner.gid);
            }
        }
    }

    // ownership fixups
    if req.build.chown_home {
        jaildir.chown_home(&mut fs, &mut mounts)?;
    }
    for dir in &req.build.chown_user {
        let owner = owner.as_ref().ok_or_else(|| {
            JailError::Usage("--chown-user requires a jail user".to_string())
        })?;
        let q = policy.allow_jail_subdir(dir);
        if !q.allowed {
            return Err(JailError::Policy(format!(
                "{}: --chown-user directory disabled by /etc/pa-jail.conf\n{}",
                dir,
                q.disable_message()
            )));
        }
        jaildir.chown_recursive(&mut fs, &mut mounts, dir, owner.uid, owner.gid)?;
    }

    // construct the jail
    let dst_root = noendslash(&jaildir.dir);
    debug_assert!(dst_root != "/");
    let mut builder = JailBuilder::new(fs, mounts, &dst_root, &link_dir);
    if !manifest.is_empty() {
        // SAFETY: umask manipulation around construction so manifest
        // modes land exactly.
        let old_umask = unsafe { libc::umask(0) };
        let r = builder.construct(&manifest, false);
        // SAFETY: restoring the saved mask.
        unsafe {
            libc::umask(old_umask);
        }
        r?;
    }

    drop(jaildir);

    if req.action == JailAction::Run {
        let owner = owner.as_ref().expect("run always has a user");
        let sup = Supervisor::new(
            input_fd,
            event_source_fd,
            timing_fd,
            req.quiet,
            req.no_onlcr,
            builder.fs.verbose,
        );
        let cfg = RunConfig {
            timeout: req.timeout,
            idle_timeout: req.idle_timeout,
            foreground: req.foreground,
            ready_marker: req.ready.clone(),
            term_size,
            no_onlcr: req.no_onlcr,
        };
        return run_jail(
            sup,
            builder,
            &endslash(&dst_root),
            owner,
            &req.command,
            &cfg,
            caller,
            pidfile,
        );
    }

    if timing_fd != -1 {
        // SAFETY: timing_fd is ours.
        unsafe {
            libc::close(timing_fd);
        }
    }
    Ok(0)
}

fn do_mv(args: MvArgs) -> Result<i32> {
    let mut fs = FsOps::new(args.verbose, args.dry_run);
    let caller = CallerIds::capture();
    escalate(args.dry_run, caller)?;

    let policy = JailPolicy::open_system()?;
    let jaildir = JailDir::open(&mut fs, &args.source, None, JailAction::Mv, false, &policy)?
        .expect("non-rm walk always yields a jail directory");

    let mut newpath = check_filename(&absolute(&args.dest)?)
        .filter(|p| p.starts_with('/'))
        .ok_or_else(|| {
            JailError::Path(format!("{}: Bad characters in move destination", args.dest))
        })?;

    // a directory destination becomes the parent
    if std::fs::metadata(&newpath).map(|m| m.is_dir()).unwrap_or(false) {
        newpath = format!("{}{}", endslash(&newpath), jaildir.component);
    }

    let q = policy.allow_jail(&newpath);
    if !q.allowed {
        return Err(JailError::Policy(format!(
            "{}: Destination jail disabled by /etc/pa-jail.conf\n{}",
            newpath,
            q.disable_message()
        )));
    }

    jaildir.rename_to(&fs, &newpath)?;
    Ok(0)
}

fn do_rm(args: RmArgs) -> Result<i32> {
    let mut fs = FsOps::new(args.verbose, args.dry_run);
    let foreground = args.fg && !args.bg;
    let caller = CallerIds::capture();
    escalate(args.dry_run, caller)?;

    let policy = JailPolicy::open_system()?;
    let Some(jaildir) = JailDir::open(
        &mut fs,
        &args.jaildir,
        None,
        JailAction::Rm,
        args.force,
        &policy,
    )?
    else {
        return Ok(0); // vanished, and --force says that is fine
    };

    if !args.dry_run && !foreground {
        // SAFETY: single-threaded; parent exits immediately.
        let pid = unsafe { libc::fork() };
        if pid > 0 {
            return Ok(0);
        }
        if pid < 0 {
            return Err(JailError::Privilege(
                "fork".into(),
                std::io::Error::last_os_error(),
            ));
        }
    }

    // unmount everything mounted below the jail, deepest first
    let mut mounts = MountTable::new(MountPhase::Manifest);
    mounts.populate()?;
    let mut dst_table: std::collections::HashMap<String, DstState> =
        std::collections::HashMap::new();
    for point in mounts.points_under(&jaildir.dir) {
        mounts.uninstall(&fs, &mut dst_table, &point)?;
    }

    jaildir.remove(&fs, &dst_table)?;
    Ok(0)
}

fn escalate(dryrun: bool, _caller: CallerIds) -> Result<()> {
    if dryrun {
        return Ok(());
    }
    nix::unistd::setresgid(
        nix::unistd::Gid::from_raw(ROOT as libc::gid_t),
        nix::unistd::Gid::from_raw(ROOT as libc::gid_t),
        nix::unistd::Gid::from_raw(ROOT as libc::gid_t),
    )
    .map_err(|e| priv_err("setresgid", e))?;
    nix::unistd::setresuid(
        nix::unistd::Uid::from_raw(ROOT),
        nix::unistd::Uid::from_raw(ROOT),
        nix::unistd::Uid::from_raw(ROOT),
    )
    .map_err(|e| priv_err("setresuid", e))
}

fn priv_err(what: &str, e: nix::errno::Errno) -> JailError {
    JailError::Privilege(what.to_string(), std::io::Error::from_raw_os_error(e as i32))
}

fn bind_event_socket(path: &str) -> Result<i32> {
    // SAFETY: standard socket setup; every return value is checked.
    unsafe {
        let fd = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0);
        if fd == -1 {
            return Err(JailError::last_os("socket"));
        }

        let mut addr: libc::sockaddr_un = std::mem::zeroed();
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        let bytes = path.as_bytes();
        if bytes.len() + 1 > addr.sun_path.len() {
            return Err(JailError::Usage(format!("{}: socket name too long", path)));
        }
        for (i, b) in bytes.iter().enumerate() {
            addr.sun_path[i] = *b as libc::c_char;
        }

        // other users may not connect to the event socket
        let old_umask = libc::umask(0o007);
        let rc = libc::bind(
            fd,
            (&addr as *const libc::sockaddr_un).cast::<libc::sockaddr>(),
            std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        );
        libc::umask(old_umask);
        if rc < 0 {
            return Err(JailError::last_os(format!("bind {}", path)));
        }

        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) == -1 {
            return Err(JailError::last_os("fcntl"));
        }
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags == -1 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(JailError::last_os("fcntl"));
        }
        Ok(fd)
    }
}
