// Rodalies GTFS download
//
// Renfe publishes every Cercanías network in a single static archive:
// - GTFS Static: https://ssl.renfe.com/ftransit/Fichero_CER_FOMENTO/fomento_transit.zip

use reqwest::blocking;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use super::error::FetchError;
use super::gtfs::{STOPS_FILE, STOP_TIMES_FILE};

/// Nested folders searched for the feed files inside an extracted archive.
const MAX_FEED_DEPTH: usize = 3;

/// Puts a fresh copy of the GTFS files into a working directory.
pub trait DatasetFetcher: Send + Sync {
    fn fetch_and_install(&self, target_dir: &Path) -> Result<(), FetchError>;
}

/// Downloads the archive over HTTP and extracts it in place of `target_dir`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    url: String,
    tmp_archive: PathBuf,
    timeout: Duration,
}

impl HttpFetcher {
    pub const DEFAULT_URL: &'static str =
        "https://ssl.renfe.com/ftransit/Fichero_CER_FOMENTO/fomento_transit.zip";

    pub fn new(url: impl Into<String>, tmp_archive: impl Into<PathBuf>, timeout: Duration) -> Self {
        HttpFetcher {
            url: url.into(),
            tmp_archive: tmp_archive.into(),
            timeout,
        }
    }

    fn create_http_client(&self) -> Result<blocking::Client, FetchError> {
        blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| FetchError::Network(format!("Failed to create HTTP client: {}", e)))
    }

    fn classify(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout { after: self.timeout }
        } else {
            FetchError::Network(e.to_string())
        }
    }

    /// Streams the archive to `tmp_archive`, returning the number of bytes written.
    /// Nothing is left at `tmp_archive` when this fails.
    fn download(&self) -> Result<u64, FetchError> {
        if let Some(parent) = self.tmp_archive.parent() {
            fs::create_dir_all(parent).map_err(|e| file_error("create download directory", parent, e))?;
        }

        let result = self.download_to_tmp();
        if result.is_err() {
            remove_file_if_exists(&self.tmp_archive);
        }
        result
    }

    fn download_to_tmp(&self) -> Result<u64, FetchError> {
        let client = self.create_http_client()?;

        let mut response = client
            .get(&self.url)
            .send()
            .map_err(|e| self.classify(e))?;

        if !response.status().is_success() {
            return Err(FetchError::BadStatus {
                code: response.status().as_u16(),
            });
        }

        let mut file = File::create(&self.tmp_archive)
            .map_err(|e| file_error("create", &self.tmp_archive, e))?;

        let written = response.copy_to(&mut file).map_err(|e| self.classify(e))?;

        file.sync_all()
            .map_err(|e| file_error("flush", &self.tmp_archive, e))?;

        Ok(written)
    }
}

impl DatasetFetcher for HttpFetcher {
    fn fetch_and_install(&self, target_dir: &Path) -> Result<(), FetchError> {
        info!("📥 Downloading Rodalies GTFS data from {}...", self.url);

        let written = self.download()?;
        info!("✓ Downloaded {} KB, extracting...", written / 1024);

        let installed = install_archive(&self.tmp_archive, target_dir);
        remove_file_if_exists(&self.tmp_archive);
        installed?;

        info!("✓ GTFS data installed into {}", target_dir.display());
        Ok(())
    }
}

// ============================================================================
// Archive installation
// ============================================================================

/// Replaces the contents of `target_dir` with the feed found in `archive_path`.
///
/// The archive is extracted next to `target_dir` first, so a corrupt download
/// or one without both `stops.txt` and `stop_times.txt` leaves the previous
/// files in place.
pub fn install_archive(archive_path: &Path, target_dir: &Path) -> Result<(), FetchError> {
    let file = File::open(archive_path).map_err(|e| file_error("open", archive_path, e))?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| FetchError::Archive(format!("Failed to open GTFS zip: {}", e)))?;

    let staging = sibling_dir(target_dir, "staging");
    remove_dir_if_exists(&staging)?;
    fs::create_dir_all(&staging).map_err(|e| file_error("create", &staging, e))?;

    if let Err(e) = archive.extract(&staging) {
        remove_dir_if_exists(&staging).ok();
        return Err(FetchError::Archive(format!("Failed to extract GTFS zip: {}", e)));
    }
    debug!("extracted {} archive entries into {}", archive.len(), staging.display());

    let Some(feed_root) = locate_feed_root(&staging, MAX_FEED_DEPTH) else {
        remove_dir_if_exists(&staging).ok();
        return Err(FetchError::Archive(format!(
            "archive does not contain both {} and {}",
            STOPS_FILE, STOP_TIMES_FILE
        )));
    };

    if let Some(parent) = target_dir.parent() {
        fs::create_dir_all(parent).map_err(|e| file_error("create", parent, e))?;
    }

    if let Err(e) = swap_into_place(&feed_root, target_dir) {
        remove_dir_if_exists(&staging).ok();
        return Err(e);
    }

    if feed_root != staging {
        info!("✓ Flattened nested feed folder {}", feed_root.display());
        remove_dir_if_exists(&staging)?;
    }

    Ok(())
}

/// Moves `staged` to `target_dir`. The previous `target_dir` is set aside
/// first and put back if the move fails.
fn swap_into_place(staged: &Path, target_dir: &Path) -> Result<(), FetchError> {
    let previous = sibling_dir(target_dir, "previous");
    remove_dir_if_exists(&previous)?;

    let set_aside = match fs::rename(target_dir, &previous) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => return Err(file_error("set aside", target_dir, e)),
    };

    if let Err(e) = fs::rename(staged, target_dir) {
        if set_aside {
            if let Err(restore) = fs::rename(&previous, target_dir) {
                warn!(
                    "⚠️  Could not restore previous feed from {}: {}",
                    previous.display(),
                    restore
                );
            }
        }
        return Err(file_error("move feed into", target_dir, e));
    }

    if set_aside {
        if let Err(e) = remove_dir_if_exists(&previous) {
            warn!("⚠️  {}", e);
        }
    }

    Ok(())
}

fn sibling_dir(target_dir: &Path, suffix: &str) -> PathBuf {
    let name = target_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "gtfs".to_string());
    target_dir.with_file_name(format!("{}.{}", name, suffix))
}

/// First directory, breadth first, holding both feed files.
fn locate_feed_root(dir: &Path, max_depth: usize) -> Option<PathBuf> {
    let mut level = vec![dir.to_path_buf()];

    for _ in 0..=max_depth {
        let mut next = Vec::new();
        for candidate in level {
            if candidate.join(STOPS_FILE).is_file() && candidate.join(STOP_TIMES_FILE).is_file() {
                return Some(candidate);
            }

            let Ok(entries) = fs::read_dir(&candidate) else {
                continue;
            };
            let mut children: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.is_dir())
                .collect();
            children.sort();
            next.extend(children);
        }
        level = next;
    }

    None
}

fn remove_dir_if_exists(dir: &Path) -> Result<(), FetchError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(file_error("remove", dir, e)),
    }
}

fn remove_file_if_exists(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("⚠️  Could not remove {}: {}", path.display(), e),
    }
}

fn file_error(action: &str, path: &Path, e: io::Error) -> FetchError {
    FetchError::File(format!("Failed to {} {}: {}", action, path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rodalies::gtfs::tests::scratch_dir;
    use crate::rodalies::gtfs;
    use actix_web::http::StatusCode;
    use actix_web::{App, HttpResponse, HttpServer, web};
    use std::io::{Cursor, Write};
    use std::net::SocketAddr;
    use zip::write::FileOptions;

    const STOPS: &str = "stop_id,stop_name\nS1,Central\n";
    const STOP_TIMES: &str = "trip_id,arrival_time,departure_time,stop_id\nR1_01,08:00:00,08:00:00,S1\n";

    fn feed_zip(prefix: &str) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default();
        if !prefix.is_empty() {
            writer.add_directory(prefix, options).unwrap();
        }
        writer.start_file(format!("{}{}", prefix, STOPS_FILE), options).unwrap();
        writer.write_all(STOPS.as_bytes()).unwrap();
        writer.start_file(format!("{}{}", prefix, STOP_TIMES_FILE), options).unwrap();
        writer.write_all(STOP_TIMES.as_bytes()).unwrap();
        writer.finish().unwrap().into_inner()
    }

    /// Serves `body` with `status` for every request on an ephemeral port.
    fn serve(status: u16, body: Vec<u8>) -> SocketAddr {
        serve_after(Duration::ZERO, status, body)
    }

    /// Like [`serve`], but holds every response back for `delay`.
    fn serve_after(delay: Duration, status: u16, body: Vec<u8>) -> SocketAddr {
        let (tx, rx) = std::sync::mpsc::channel();

        std::thread::spawn(move || {
            actix_web::rt::System::new().block_on(async move {
                let body = web::Bytes::from(body);
                let server = HttpServer::new(move || {
                    let body = body.clone();
                    App::new().default_service(web::to(move || {
                        let body = body.clone();
                        async move {
                            actix_web::rt::time::sleep(delay).await;
                            HttpResponse::build(StatusCode::from_u16(status).unwrap()).body(body)
                        }
                    }))
                })
                .workers(1)
                .bind(("127.0.0.1", 0))
                .unwrap();

                tx.send(server.addrs()[0]).unwrap();
                server.run().await
            })
        });

        rx.recv().unwrap()
    }

    fn fetcher_for(addr: SocketAddr, work: &Path) -> HttpFetcher {
        HttpFetcher::new(
            format!("http://{}/fomento_transit.zip", addr),
            work.join("temp_gtfs.zip"),
            Duration::from_secs(10),
        )
    }

    #[test]
    fn test_bad_status_leaves_no_archive_behind() {
        let work = scratch_dir("fetch_503");
        let addr = serve(503, b"unavailable".to_vec());
        let fetcher = fetcher_for(addr, &work);

        let err = fetcher.fetch_and_install(&work.join("gtfs")).unwrap_err();

        assert_eq!(err, FetchError::BadStatus { code: 503 });
        assert_eq!(err.reason(), "bad-status");
        assert!(!work.join("temp_gtfs.zip").exists());
        assert!(!work.join("gtfs").exists());

        fs::remove_dir_all(&work).ok();
    }

    #[test]
    fn test_network_error_is_reported() {
        let work = scratch_dir("fetch_refused");
        // Bind then drop a listener to get a port nobody answers on
        let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let fetcher = fetcher_for(port, &work);

        let err = fetcher.fetch_and_install(&work.join("gtfs")).unwrap_err();

        assert_eq!(err.reason(), "network");
        assert!(!work.join("temp_gtfs.zip").exists());

        fs::remove_dir_all(&work).ok();
    }

    #[test]
    fn test_slow_server_times_out() {
        let work = scratch_dir("fetch_timeout");
        let addr = serve_after(Duration::from_secs(3), 200, feed_zip(""));
        let fetcher = HttpFetcher::new(
            format!("http://{}/fomento_transit.zip", addr),
            work.join("temp_gtfs.zip"),
            Duration::from_secs(1),
        );

        let err = fetcher.fetch_and_install(&work.join("gtfs")).unwrap_err();

        assert_eq!(err.reason(), "timeout");
        assert_eq!(
            err,
            FetchError::Timeout {
                after: Duration::from_secs(1)
            }
        );
        assert!(!work.join("temp_gtfs.zip").exists());
        assert!(!work.join("gtfs").exists());

        fs::remove_dir_all(&work).ok();
    }

    #[test]
    fn test_download_replaces_previous_feed() {
        let work = scratch_dir("fetch_ok");
        let target = work.join("gtfs");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("stale.txt"), "old").unwrap();

        let addr = serve(200, feed_zip(""));
        fetcher_for(addr, &work).fetch_and_install(&target).unwrap();

        assert!(!target.join("stale.txt").exists());
        assert!(!work.join("temp_gtfs.zip").exists());
        let index = gtfs::load(&target).unwrap();
        assert_eq!(index.stop_name("S1"), Some("Central"));
        assert!(!sibling_dir(&target, "previous").exists());
        assert!(!sibling_dir(&target, "staging").exists());

        fs::remove_dir_all(&work).ok();
    }

    #[test]
    fn test_nested_archive_is_flattened() {
        let work = scratch_dir("nested");
        let archive = work.join("feed.zip");
        fs::write(&archive, feed_zip("fomento_transit/")).unwrap();
        let target = work.join("gtfs");

        install_archive(&archive, &target).unwrap();

        assert!(target.join(STOPS_FILE).is_file());
        assert!(target.join(STOP_TIMES_FILE).is_file());
        assert!(!sibling_dir(&target, "staging").exists());

        fs::remove_dir_all(&work).ok();
    }

    #[test]
    fn test_archive_without_feed_keeps_previous_files() {
        let work = scratch_dir("no_feed");
        let target = work.join("gtfs");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join(STOPS_FILE), STOPS).unwrap();

        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file("README.txt", FileOptions::default()).unwrap();
        writer.write_all(b"nothing here").unwrap();
        let archive = work.join("feed.zip");
        fs::write(&archive, writer.finish().unwrap().into_inner()).unwrap();

        let err = install_archive(&archive, &target).unwrap_err();

        assert_eq!(err.reason(), "archive");
        assert!(target.join(STOPS_FILE).is_file());

        fs::remove_dir_all(&work).ok();
    }

    #[test]
    fn test_archive_without_stop_times_keeps_previous_files() {
        let work = scratch_dir("no_stop_times");
        let target = work.join("gtfs");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join(STOPS_FILE), STOPS).unwrap();
        fs::write(target.join(STOP_TIMES_FILE), STOP_TIMES).unwrap();

        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file(STOPS_FILE, FileOptions::default()).unwrap();
        writer.write_all(b"stop_id,stop_name\nS9,Elsewhere\n").unwrap();
        let archive = work.join("feed.zip");
        fs::write(&archive, writer.finish().unwrap().into_inner()).unwrap();

        let err = install_archive(&archive, &target).unwrap_err();

        assert_eq!(err.reason(), "archive");
        let index = gtfs::load(&target).unwrap();
        assert_eq!(index.stop_name("S1"), Some("Central"));
        assert_eq!(index.stop_time_count(), 1);
        assert!(!sibling_dir(&target, "staging").exists());

        fs::remove_dir_all(&work).ok();
    }

    #[test]
    fn test_failed_move_restores_previous_feed() {
        let work = scratch_dir("failed_move");
        let target = work.join("gtfs");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join(STOPS_FILE), STOPS).unwrap();
        fs::write(target.join(STOP_TIMES_FILE), STOP_TIMES).unwrap();

        let err = swap_into_place(&work.join("gone.staging"), &target).unwrap_err();

        assert_eq!(err.reason(), "file");
        assert!(gtfs::load(&target).is_ok());
        assert!(!sibling_dir(&target, "previous").exists());

        fs::remove_dir_all(&work).ok();
    }

    #[test]
    fn test_corrupt_archive_is_rejected() {
        let work = scratch_dir("corrupt");
        let archive = work.join("feed.zip");
        fs::write(&archive, b"not a zip").unwrap();

        let err = install_archive(&archive, &work.join("gtfs")).unwrap_err();
        assert_eq!(err.reason(), "archive");

        fs::remove_dir_all(&work).ok();
    }
}
