//! Downloading the containers of one link and feeding them to the interpreter.

use anyhow::Context;
use crossbeam::channel::bounded;
use tracing::{debug, info};

use crate::compression::CompressionMethod;
use crate::storage::{Folder, FolderRef};
use crate::sync::CancellationToken;
use crate::Result;

use super::interpreter::TarInterpreter;
use super::is_pg_control_tar;

/// Stored container names of a link. `pg_control` is kept apart since it
/// must be extracted last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkTars {
    pub regular: Vec<String>,
    pub pg_control: Option<String>,
}

pub fn link_tars(tar_folder: &dyn Folder) -> Result<LinkTars> {
    let mut tars = LinkTars::default();
    let mut names: Vec<String> = tar_folder.list()?.objects.into_iter().map(|o| o.name).collect();
    names.sort();
    for name in names {
        if is_pg_control_tar(&name) {
            if let Some(previous) = tars.pg_control.replace(name.clone()) {
                anyhow::bail!("two pg_control containers in {}: {previous} and {name}", tar_folder.path());
            }
        } else {
            tars.regular.push(name);
        }
    }
    Ok(tars)
}

/// Download and interpret `tars` with up to `concurrency` parallel workers.
/// The first failure is returned, naming the container; the remaining
/// workers finish their current container and stop.
pub fn extract_all(tar_folder: &FolderRef, tars: &[String], interpreter: &TarInterpreter, concurrency: usize) -> Result<usize> {
    if tars.is_empty() {
        return Ok(0);
    }
    for_each_parallel(tars, concurrency, |tar| extract_one(tar_folder.as_ref(), tar, interpreter))?;
    info!(folder = %tar_folder.path(), tars = tars.len(), "containers_extracted");
    Ok(tars.len())
}

/// Run `work` over `items` on up to `concurrency` workers. A failing worker
/// cancels the others before they pick up their next item.
fn for_each_parallel<T, F>(items: &[T], concurrency: usize, work: F) -> Result<()>
where
    T: Sync,
    F: Fn(&T) -> Result<()> + Sync,
{
    let workers = concurrency.clamp(1, items.len().max(1));
    let (tx, rx) = bounded::<&T>(items.len());
    for item in items {
        tx.send(item).map_err(|_| anyhow::anyhow!("extraction queue closed"))?;
    }
    drop(tx);
    let cancel = CancellationToken::new();

    crossbeam::thread::scope(|scope| -> Result<()> {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let rx = rx.clone();
                let (cancel, work) = (&cancel, &work);
                scope.spawn(move |_| -> Result<()> {
                    for item in rx.iter() {
                        if cancel.is_cancelled() {
                            break;
                        }
                        if let Err(e) = work(item) {
                            cancel.cancel();
                            return Err(e);
                        }
                    }
                    Ok(())
                })
            })
            .collect();
        let mut first_error = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    cancel.cancel();
                    first_error.get_or_insert(anyhow::anyhow!("extraction worker panicked"));
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    })
    .map_err(|_| anyhow::anyhow!("extraction scope panicked"))?
}

fn extract_one(tar_folder: &dyn Folder, stored: &str, interpreter: &TarInterpreter) -> Result<()> {
    let (method, _) = CompressionMethod::from_object_name(stored);
    let raw = tar_folder.open(stored)?;
    let reader = method.decompressor(raw)?;
    let entries = interpreter
        .interpret_tar(reader)
        .with_context(|| format!("extracting container {stored}"))?;
    debug!(tar = %stored, entries, "container_extracted");
    Ok(())
}
