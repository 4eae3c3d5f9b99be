use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{info, warn};

use photo_pipeline::loader::SqliteAssociationStore;
use photo_pipeline::pipeline::Coalescer;
use photo_pipeline::scanner::FileScanner;
use photo_pipeline::{ImageQuality, LoadManager, LoadRequest, LoaderConfig, Stage};

/// Longest side of a gallery cell in the demo.
const DISPLAY_SIZE: u32 = 320;

const POLL: Duration = Duration::from_millis(50);

struct Args {
    folder: PathBuf,
    tours_db: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut folder = None;
    let mut tours_db = None;
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--tours" => {
                tours_db = Some(PathBuf::from(
                    args.next().context("--tours needs a database path")?,
                ));
            }
            _ => folder = Some(PathBuf::from(arg)),
        }
    }

    Ok(Args {
        folder: folder.unwrap_or_else(|| PathBuf::from(".")),
        tours_db,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("photo_pipeline=info".parse()?),
        )
        .init();

    let args = parse_args()?;
    let scan = FileScanner::new().scan(&args.folder).await?;
    if scan.files.is_empty() {
        info!("No photos in {:?}", args.folder);
        return Ok(());
    }

    let mut builder = LoadManager::builder(LoaderConfig::default());
    if let Some(db) = &args.tours_db {
        builder = builder.association_source(Arc::new(SqliteAssociationStore::open(db)?));
    }
    let manager = Arc::new(builder.build());

    let photos: Vec<_> = scan.files.into_iter().map(|f| manager.photo(f)).collect();
    let started = Instant::now();

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling pending loads");
                cancel.store(true, Ordering::Release);
                manager.stop_loading(true);
            }
        });
    }

    for photo in &photos {
        manager.enqueue(LoadRequest::exif(Arc::clone(photo)));
        manager.enqueue(LoadRequest::associations(Arc::clone(photo)));
    }

    let exif_done = {
        let manager = Arc::clone(&manager);
        let cancel = Arc::clone(&cancel);
        tokio::task::spawn_blocking(move || {
            manager.wait_for_exif(&cancel, POLL, |remaining| {
                tracing::trace!(remaining, "Waiting for metadata");
            })
        })
        .await?
    };
    if !exif_done {
        manager.shutdown();
        return Ok(());
    }
    info!(photos = photos.len(), elapsed = ?started.elapsed(), "Metadata loaded");

    // Progress is logged at most once per burst of completions.
    let loaded = Arc::new(AtomicUsize::new(0));
    let progress = {
        let loaded = Arc::clone(&loaded);
        let total = photos.len();
        Arc::new(Coalescer::new("progress", move || {
            info!("Thumbnails {}/{}", loaded.load(Ordering::Acquire), total);
            std::thread::sleep(Duration::from_millis(250));
        }))
    };

    for photo in &photos {
        let loaded = Arc::clone(&loaded);
        let progress = Arc::clone(&progress);
        let request = LoadRequest::image(Arc::clone(photo), ImageQuality::Thumb)
            .with_display_size(DISPLAY_SIZE)
            .with_callback(move |event| {
                if event.quality() == Some(ImageQuality::Thumb) {
                    loaded.fetch_add(1, Ordering::AcqRel);
                    progress.trigger();
                }
            });
        manager.enqueue(request);
    }

    while !cancel.load(Ordering::Acquire)
        && (manager.is_busy(Stage::Thumbnail) || manager.is_busy(Stage::HighQuality))
    {
        tokio::time::sleep(POLL).await;
    }

    let failed = photos.iter().filter(|p| manager.is_failed(p.path())).count();
    let toured = photos.iter().filter(|p| !p.tour_ids().is_empty()).count();
    info!(
        photos = photos.len(),
        thumbnails = loaded.load(Ordering::Acquire),
        failed,
        toured,
        cached_images = manager.resized_cache().len(),
        cache_bytes = manager.resized_cache().memory_usage(),
        elapsed = ?started.elapsed(),
        "Done"
    );

    progress.stop();
    manager.shutdown();
    Ok(())
}
