use std::{error::Error, path::Path, time::Duration};

use crate::{
    manager::{FetchDetails, RepositoryManager, RepositoryManagerDelegate},
    provider::{Repository as _, WorkingCopy as _},
    specifier::RepositorySpecifier,
};

/// Handler to fetch command
pub fn do_fetch(
    manager: &RepositoryManager,
    location: &str,
    skip_update: bool,
) -> Result<(), Box<dyn Error>> {
    let specifier = RepositorySpecifier::from_location(location)?;
    let handle = manager.lookup(&specifier, skip_update)?;

    let repository = handle.open()?;
    let tags = repository.tags()?;
    log::info!(
        "Mirror for {} at {} ({} tags)",
        specifier,
        handle.path().display(),
        tags.len()
    );
    println!("{}", handle.path().display());
    Ok(())
}

/// Handler to checkout command
pub fn do_checkout(
    manager: &RepositoryManager,
    location: &str,
    destination: &str,
    editable: bool,
) -> Result<(), Box<dyn Error>> {
    let specifier = RepositorySpecifier::from_location(location)?;
    let handle = manager.lookup(&specifier, false)?;

    let checkout = handle.create_working_copy(Path::new(destination), editable)?;
    log::info!(
        "Checked out {} at {}",
        checkout.current_revision()?,
        checkout.path().display()
    );
    Ok(())
}

/// Handler to remove command
pub fn do_remove(manager: &RepositoryManager, location: &str) -> Result<(), Box<dyn Error>> {
    let specifier = RepositorySpecifier::from_location(location)?;
    manager.remove(&specifier)?;
    log::info!("Removed {}", specifier);
    Ok(())
}

/// Handler to reset command
pub fn do_reset(manager: &RepositoryManager) -> Result<(), Box<dyn Error>> {
    manager.reset()?;
    Ok(())
}

/// Delegate reporting fetch and update activity on the log facade.
pub struct LoggingDelegate;

impl RepositoryManagerDelegate for LoggingDelegate {
    fn will_fetch(&self, specifier: &RepositorySpecifier, details: &FetchDetails) {
        if details.from_cache {
            log::info!("Fetching {} from the shared cache", specifier);
        } else {
            log::info!("Fetching {}", specifier);
        }
    }

    fn fetching(&self, specifier: &RepositorySpecifier, objects_fetched: u64, total: Option<u64>) {
        match total {
            Some(total) => log::debug!("Fetching {}: {}/{} objects", specifier, objects_fetched, total),
            None => log::debug!("Fetching {}: {} objects", specifier, objects_fetched),
        }
    }

    fn did_fetch(
        &self,
        specifier: &RepositorySpecifier,
        result: &Result<FetchDetails, crate::manager::Error>,
        duration: Duration,
    ) {
        match result {
            Ok(_) => log::info!("Fetched {} in {:.1}s", specifier, duration.as_secs_f64()),
            Err(error) => log::error!("Failed to fetch {}: {}", specifier, error),
        }
    }

    fn will_update(&self, specifier: &RepositorySpecifier) {
        log::info!("Updating {}", specifier);
    }

    fn did_update(
        &self,
        specifier: &RepositorySpecifier,
        result: &Result<(), crate::manager::Error>,
        duration: Duration,
    ) {
        match result {
            Ok(()) => log::info!("Updated {} in {:.1}s", specifier, duration.as_secs_f64()),
            Err(error) => log::warn!("Failed to update {}: {}", specifier, error),
        }
    }
}
