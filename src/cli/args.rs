use clap::Parser;

/// Persistent cache of source repository mirrors.
#[derive(Debug, Parser)]
#[clap(version)]
pub struct CliArgs {
    #[clap(subcommand)]
    pub cmd: Command,
    #[clap(short, long)]
    /// Location of the repository storage root [default: platform-specific]
    pub root_directory: Option<String>,
    #[clap(short, long)]
    /// Location of the shared mirror cache staged between storage roots
    pub cache_directory: Option<String>,
}

#[derive(Debug, Parser)]
pub enum Command {
    /// Fetches a repository into the store, or refreshes an existing mirror
    Fetch {
        /// URL or absolute path of the repository
        location: String,
        #[clap(short, long)]
        /// returns the existing mirror without refreshing it
        skip_update: bool,
    },
    /// Creates a working checkout of a repository at a destination directory
    Checkout {
        /// URL or absolute path of the repository
        location: String,
        /// directory to materialize the working tree in
        destination: String,
        #[clap(short, long)]
        /// leaves the checkout free to develop in
        editable: bool,
    },
    /// Removes a repository mirror and its record
    Remove {
        /// URL or absolute path of the repository
        location: String,
    },
    /// Removes every mirror and resets the store.
    /// The next fetch of any repository starts from scratch.
    Reset,
}
