/// houdini: a container backend that runs processes directly on the host
///
/// Each container is a private work dir under a depot with its bind mounts
/// applied. Processes run as ordinary host processes, grouped so that one
/// signal reaches every descendant. There is no isolation.
///
/// # Usage
/// ```bash
/// houdini run --depot /var/houdini --bind /srv/data:data:ro -- sh -c 'ls data'
/// houdini mounts --depot /var/houdini --bind /srv/data:data
/// ```
use anyhow::Result;

fn main() -> Result<()> {
    // Initialize logger
    env_logger::init();

    let code = houdini::cli::run()?;
    std::process::exit(code);
}
