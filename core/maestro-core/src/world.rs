//! World membership and master election.
//!
//! A world is a runtime directory plus an index. Whichever process holds the
//! exclusive `flock` on `world-<index>.lock` is the master and serves
//! `world-<index>.sock`; everyone else joins as a slave. The kernel drops the
//! lock when the master dies, so a crashed coordinator never leaves the world
//! wedged. The lock file itself is never removed.

use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use fs_err as fs;
use tracing::{debug, info, warn};

use crate::error::{MaestroError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldRole {
    Master,
    Slave,
}

#[derive(Debug)]
pub struct World {
    index: u32,
    dir: PathBuf,
    role: WorldRole,
    lock: Option<fs::File>,
}

pub fn lock_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("world-{}.lock", index))
}

pub fn socket_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("world-{}.sock", index))
}

impl World {
    /// Enters world `index`. With `as_slave` set, finding no master is an
    /// error rather than an election win.
    pub fn enter(index: u32, dir: &Path, as_slave: bool) -> Result<World> {
        fs::create_dir_all(dir).map_err(|err| MaestroError::io("create runtime dir", err))?;
        let path = lock_path(dir, index);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| MaestroError::io("open world lock", err))?;

        if !try_lock_exclusive(file.file())? {
            debug!(world = index, "World already has a master; joining as slave");
            return Ok(World {
                index,
                dir: dir.to_path_buf(),
                role: WorldRole::Slave,
                lock: None,
            });
        }

        if as_slave {
            // Dropping the file releases the lock we just took.
            drop(file);
            return Err(MaestroError::NotRunning { index });
        }

        file.set_len(0)
            .and_then(|_| writeln!(file, "{}", std::process::id()))
            .map_err(|err| MaestroError::io("write world lock", err))?;
        info!(world = index, lock = %path.display(), "Elected world master");

        Ok(World {
            index,
            dir: dir.to_path_buf(),
            role: WorldRole::Master,
            lock: Some(file),
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn role(&self) -> WorldRole {
        self.role
    }

    pub fn is_master(&self) -> bool {
        self.role == WorldRole::Master
    }

    pub fn socket_path(&self) -> PathBuf {
        socket_path(&self.dir, self.index)
    }

    /// Leaves the world. The master removes its socket and releases the
    /// election lock; a slave has nothing to undo.
    pub fn leave(mut self) -> Result<()> {
        let Some(lock) = self.lock.take() else {
            return Ok(());
        };
        let socket = self.socket_path();
        match fs::remove_file(&socket) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(error = %err, "Failed to remove world socket"),
        }
        drop(lock);
        info!(world = self.index, "Left world");
        Ok(())
    }
}

/// Pid recorded by the current master, or `None` when nobody holds the world.
/// A master that has not written its pid yet reports as pid 0.
pub fn running_master(index: u32, dir: &Path) -> Result<Option<u32>> {
    let path = lock_path(dir, index);
    if !path.exists() {
        return Ok(None);
    }
    let mut file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|err| MaestroError::io("open world lock", err))?;
    if try_lock_exclusive(file.file())? {
        return Ok(None);
    }
    let mut content = String::new();
    file.read_to_string(&mut content)
        .map_err(|err| MaestroError::io("read world lock", err))?;
    Ok(Some(content.trim().parse().unwrap_or(0)))
}

fn try_lock_exclusive(file: &std::fs::File) -> Result<bool> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(MaestroError::io("lock world", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_entrant_becomes_master() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let world = World::enter(0, temp_dir.path(), false).expect("enter");
        assert!(world.is_master());
        assert_eq!(
            running_master(0, temp_dir.path()).expect("lookup master"),
            Some(std::process::id())
        );
    }

    #[test]
    fn second_entrant_is_slave() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let master = World::enter(2, temp_dir.path(), false).expect("master");
        let slave = World::enter(2, temp_dir.path(), true).expect("slave");
        assert_eq!(slave.role(), WorldRole::Slave);
        assert_eq!(slave.socket_path(), master.socket_path());
    }

    #[test]
    fn slave_without_master_is_not_running() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let err = World::enter(1, temp_dir.path(), true).expect_err("no master");
        assert!(matches!(err, MaestroError::NotRunning { index: 1 }));
        // The failed slave attempt must not keep the lock.
        let world = World::enter(1, temp_dir.path(), false).expect("enter");
        assert!(world.is_master());
    }

    #[test]
    fn worlds_are_independent() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let zero = World::enter(0, temp_dir.path(), false).expect("world 0");
        let one = World::enter(1, temp_dir.path(), false).expect("world 1");
        assert!(zero.is_master());
        assert!(one.is_master());
    }

    #[test]
    fn leave_releases_lock_and_socket() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let world = World::enter(0, temp_dir.path(), false).expect("enter");
        fs::write(world.socket_path(), b"").expect("fake socket");
        let socket = world.socket_path();
        world.leave().expect("leave");

        assert!(!socket.exists());
        assert!(lock_path(temp_dir.path(), 0).exists());
        assert_eq!(running_master(0, temp_dir.path()).expect("lookup master"), None);
    }
}
