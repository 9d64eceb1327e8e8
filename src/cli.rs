//! Interactive CLI menu for imghost
//! Uses dialoguer for user interaction and indicatif for upload progress

use std::collections::HashMap;
use std::fmt;
use std::io::{self, IsTerminal};
use std::error::Error as StdError;
use std::sync::Arc;

use console::style;
use dialoguer::{Confirm, Input, MultiSelect, Password, Select, theme::ColorfulTheme};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::api::ApiClient;
use crate::auth_store::AuthStore;
use crate::events::{EventBus, UploadEvent};
use crate::image_store::ImageStore;
use crate::links::{ImageVariant, LinkFormat, generate_image_links, generate_link, variant_url};
use crate::models::{ImageFile, ImageInfo, UploadOptions, UploadResult};
use crate::staging::StagingStore;
use crate::upload::UploadPipeline;
use crate::utils::format_file_size;

// Custom error type for CLI operations
#[derive(Debug)]
pub enum CliError {
    Io(io::Error),
    Dialoguer(dialoguer::Error),
    NotInteractive,
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Io(e) => write!(f, "IO error: {}", e),
            CliError::Dialoguer(e) => write!(f, "UI interaction error: {}", e),
            CliError::NotInteractive => write!(f, "Not running in an interactive terminal"),
        }
    }
}

impl StdError for CliError {}

impl From<io::Error> for CliError {
    fn from(err: io::Error) -> Self {
        CliError::Io(err)
    }
}

impl From<dialoguer::Error> for CliError {
    fn from(err: dialoguer::Error) -> Self {
        CliError::Dialoguer(err)
    }
}

// Result type alias for CLI operations
pub type CliResult<T> = Result<T, CliError>;

/// Main menu options
#[derive(Debug, Clone, Copy)]
pub enum MainMenuOption {
    StageFiles,
    SelectStaged,
    RenameStaged,
    ClearStaged,
    UploadStaged,
    UploadFromUrl,
    ListGallery,
    ListRemote,
    ShowLinks,
    DeleteImage,
    SetToken,
    Logout,
    Exit,
}

impl MainMenuOption {
    pub fn variants() -> &'static [MainMenuOption] {
        &[
            MainMenuOption::StageFiles,
            MainMenuOption::SelectStaged,
            MainMenuOption::RenameStaged,
            MainMenuOption::ClearStaged,
            MainMenuOption::UploadStaged,
            MainMenuOption::UploadFromUrl,
            MainMenuOption::ListGallery,
            MainMenuOption::ListRemote,
            MainMenuOption::ShowLinks,
            MainMenuOption::DeleteImage,
            MainMenuOption::SetToken,
            MainMenuOption::Logout,
            MainMenuOption::Exit,
        ]
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            MainMenuOption::StageFiles => "Stage files",
            MainMenuOption::SelectStaged => "Choose staged files to upload",
            MainMenuOption::RenameStaged => "Rename a staged file",
            MainMenuOption::ClearStaged => "Clear staging area",
            MainMenuOption::UploadStaged => "Upload selected files",
            MainMenuOption::UploadFromUrl => "Upload from URL",
            MainMenuOption::ListGallery => "List gallery",
            MainMenuOption::ListRemote => "List images on the server",
            MainMenuOption::ShowLinks => "Show links for an image",
            MainMenuOption::DeleteImage => "Delete an image",
            MainMenuOption::SetToken => "Set session token",
            MainMenuOption::Logout => "Log out",
            MainMenuOption::Exit => "Exit",
        }
    }
}

/// Shared state the menu operates on
pub struct CliContext {
    pub events: Arc<EventBus>,
    pub staging: Arc<StagingStore>,
    pub store: Arc<ImageStore>,
    pub auth: Arc<AuthStore>,
    pub pipeline: Arc<UploadPipeline>,
    /// Present when a remote API is configured
    pub api: Option<Arc<ApiClient>>,
    pub upload_defaults: UploadOptions,
}

/// Renders `upload:progress` events as one bar per file while an operation runs
struct ProgressTracker {
    task: JoinHandle<()>,
}

impl ProgressTracker {
    fn start(events: &EventBus) -> Self {
        let mut rx = events.subscribe();
        let task = tokio::spawn(async move {
            let multi = MultiProgress::new();
            let bar_style = ProgressStyle::with_template("{prefix:>24.cyan} [{bar:32.green/white}] {pos:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar());
            let mut bars: HashMap<String, ProgressBar> = HashMap::new();

            loop {
                match rx.recv().await {
                    Ok(UploadEvent::Progress(p)) => {
                        let bar = bars.entry(p.filename.clone()).or_insert_with(|| {
                            let bar = multi.add(ProgressBar::new(100));
                            bar.set_style(bar_style.clone());
                            bar.set_prefix(p.filename.clone());
                            bar
                        });
                        bar.set_position(p.progress as u64);
                        if let Some(message) = p.message {
                            bar.set_message(message);
                        }
                        if p.progress >= 100 {
                            bar.finish();
                        }
                    }
                    Ok(UploadEvent::Error(message)) => {
                        let _ = multi.println(format!("{} {}", style("error:").red().bold(), message));
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => debug!("Progress display skipped {} events", skipped),
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Self { task }
    }

    async fn stop(self) {
        // Let the last emitted events render before tearing the bars down
        tokio::task::yield_now().await;
        self.task.abort();
        let _ = self.task.await;
    }
}

pub struct CliManager {
    ctx: CliContext,
    theme: ColorfulTheme,
}

impl CliManager {
    pub fn new(ctx: CliContext) -> CliResult<Self> {
        if !Self::is_interactive_terminal() {
            println!("Warning: Not running in an interactive terminal.");
            println!("Please run this program from a proper terminal.");
            return Err(CliError::NotInteractive);
        }

        Ok(Self {
            ctx,
            theme: ColorfulTheme::default(),
        })
    }

    fn is_interactive_terminal() -> bool {
        std::io::stdin().is_terminal() && std::io::stdout().is_terminal()
    }

    /// Run the main menu loop
    pub async fn run(&self) -> CliResult<()> {
        loop {
            match self.show_main_menu()? {
                MainMenuOption::StageFiles => self.stage_files().await?,
                MainMenuOption::SelectStaged => self.select_staged()?,
                MainMenuOption::RenameStaged => self.rename_staged()?,
                MainMenuOption::ClearStaged => self.clear_staged()?,
                MainMenuOption::UploadStaged => self.upload_staged().await?,
                MainMenuOption::UploadFromUrl => self.upload_from_url().await?,
                MainMenuOption::ListGallery => self.list_gallery()?,
                MainMenuOption::ListRemote => self.list_remote().await?,
                MainMenuOption::ShowLinks => self.show_links()?,
                MainMenuOption::DeleteImage => self.delete_image().await?,
                MainMenuOption::SetToken => self.set_token().await?,
                MainMenuOption::Logout => self.logout()?,
                MainMenuOption::Exit => {
                    println!("{}", style("Exiting...").cyan());
                    break;
                }
            }
        }
        Ok(())
    }

    fn show_main_menu(&self) -> CliResult<MainMenuOption> {
        let options = MainMenuOption::variants();
        let option_names: Vec<&str> = options.iter().map(|o| o.display_name()).collect();

        let user = self
            .ctx
            .auth
            .session()
            .map(|s| s.username)
            .unwrap_or_else(|| "not logged in".to_string());
        println!(
            "\n{} {}",
            style("imghost - Main Menu").cyan().bold(),
            style(format!("({}, {} staged, {} in gallery)", user, self.ctx.staging.len(), self.ctx.store.len())).dim()
        );

        let selection = Select::with_theme(&self.theme)
            .items(&option_names)
            .default(0)
            .interact()?;

        Ok(options[selection])
    }

    async fn stage_files(&self) -> CliResult<()> {
        let raw: String = Input::with_theme(&self.theme)
            .with_prompt("File paths (separate several with ';')")
            .interact_text()?;

        let mut files = Vec::new();
        for path in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            match ImageFile::from_path(path).await {
                Ok(file) if file.is_image() => files.push(file),
                Ok(file) => println!("{} {} is not an image", style("Skipped:").yellow(), file.name),
                Err(e) => println!("{} {}: {}", style("Could not read").red(), path, e),
            }
        }

        let ids = self.ctx.staging.add_images(files);
        println!("{}", style(format!("Staged {} file(s)", ids.len())).green());
        Ok(())
    }

    fn select_staged(&self) -> CliResult<()> {
        let staged = self.ctx.staging.get_images();
        if staged.is_empty() {
            println!("{}", style("Nothing staged.").yellow());
            return Ok(());
        }

        let labels: Vec<String> = staged
            .iter()
            .map(|s| format!("{} ({})", s.custom_name, format_file_size(s.file.size())))
            .collect();
        let defaults: Vec<bool> = staged.iter().map(|s| s.selected).collect();

        let chosen = MultiSelect::with_theme(&self.theme)
            .with_prompt("Select files to upload (Space to toggle, Enter to confirm)")
            .items(&labels)
            .defaults(&defaults)
            .interact()?;

        for (i, entry) in staged.iter().enumerate() {
            self.ctx.staging.update_selected(&entry.id, chosen.contains(&i));
        }
        Ok(())
    }

    fn rename_staged(&self) -> CliResult<()> {
        let staged = self.ctx.staging.get_images();
        if staged.is_empty() {
            println!("{}", style("Nothing staged.").yellow());
            return Ok(());
        }

        let labels: Vec<&str> = staged.iter().map(|s| s.custom_name.as_str()).collect();
        let index = Select::with_theme(&self.theme)
            .with_prompt("File to rename")
            .items(&labels)
            .interact()?;

        let name: String = Input::with_theme(&self.theme)
            .with_prompt("New name")
            .with_initial_text(staged[index].custom_name.clone())
            .interact_text()?;
        self.ctx.staging.update_custom_name(&staged[index].id, name);
        Ok(())
    }

    fn clear_staged(&self) -> CliResult<()> {
        if Confirm::with_theme(&self.theme)
            .with_prompt("Remove every staged file?")
            .default(false)
            .interact()?
        {
            self.ctx.staging.clear_images();
        }
        Ok(())
    }

    fn ask_upload_options(&self) -> CliResult<UploadOptions> {
        let mut options = self.ctx.upload_defaults.clone();

        options.remove_exif = Confirm::with_theme(&self.theme)
            .with_prompt("Remove EXIF metadata?")
            .default(options.remove_exif)
            .interact()?;

        if Confirm::with_theme(&self.theme)
            .with_prompt("Add a watermark?")
            .default(options.add_watermark)
            .interact()?
        {
            let text: String = Input::with_theme(&self.theme)
                .with_prompt("Watermark text")
                .with_initial_text(options.watermark_text.clone())
                .interact_text()?;
            options = options.with_watermark(text);
        } else {
            options.add_watermark = false;
        }

        let categories = self.ctx.store.categories();
        let names: Vec<&str> = categories.iter().map(|c| c.name.as_str()).collect();
        let category = Select::with_theme(&self.theme)
            .with_prompt("Category")
            .items(&names)
            .default(0)
            .interact()?;
        Ok(options.with_category(categories[category].id.clone()))
    }

    async fn upload_staged(&self) -> CliResult<()> {
        if self.ctx.staging.get_selected_images().is_empty() {
            println!("{}", style("No staged files are selected.").yellow());
            return Ok(());
        }

        let options = self.ask_upload_options()?;
        let tracker = ProgressTracker::start(&self.ctx.events);
        let results = self.ctx.pipeline.upload_staged(&self.ctx.staging, &options).await;
        tracker.stop().await;

        self.print_results(&results);
        Ok(())
    }

    async fn upload_from_url(&self) -> CliResult<()> {
        let url: String = Input::with_theme(&self.theme)
            .with_prompt("Image URL")
            .interact_text()?;
        let options = self.ask_upload_options()?;

        let tracker = ProgressTracker::start(&self.ctx.events);
        let outcome = self.ctx.pipeline.upload_from_url(url.trim(), &options).await;
        tracker.stop().await;

        match outcome {
            Ok(result) => self.print_results(std::slice::from_ref(&result)),
            Err(e) => println!("{}: {}", style("Upload failed").red().bold(), e),
        }
        Ok(())
    }

    fn print_results(&self, results: &[UploadResult]) {
        if results.is_empty() {
            println!("{}", style("Nothing was uploaded.").yellow());
            return;
        }
        for result in results {
            let tag = if result.deduplicated { "duplicate" } else { "uploaded" };
            println!("{} {}", style(format!("[{}]", tag)).green(), result.url);
        }
    }

    fn list_gallery(&self) -> CliResult<()> {
        let images = self.ctx.store.images();
        if images.is_empty() {
            println!("{}", style("The gallery is empty.").yellow());
            return Ok(());
        }

        for image in &images {
            let dims = match (image.width, image.height) {
                (Some(w), Some(h)) => format!("{}x{}", w, h),
                _ => "-".to_string(),
            };
            let uploaded = chrono::DateTime::from_timestamp_millis(image.upload_time)
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            println!(
                "{}  {:<28} {:>10} {:>10}  {}",
                style(&image.id).cyan(),
                image.display_name(),
                format_file_size(image.size),
                dims,
                style(uploaded).dim()
            );
        }
        Ok(())
    }

    async fn list_remote(&self) -> CliResult<()> {
        let Some(api) = &self.ctx.api else {
            println!("{}", style("No remote API is configured.").yellow());
            return Ok(());
        };

        match api.list_images().await {
            Ok(images) if images.is_empty() => {
                println!("{}", style(format!("{} has no images on the server.", api.owner())).yellow())
            }
            Ok(images) => {
                for image in &images {
                    println!("{}  {}", style(&image.id).cyan(), image.original);
                }
            }
            Err(e) => {
                warn!("Listing remote images failed: {}", e);
                println!("{}: {}", style("Could not list remote images").red().bold(), e);
            }
        }
        Ok(())
    }

    fn pick_image(&self, prompt: &str) -> CliResult<Option<ImageInfo>> {
        let images = self.ctx.store.images();
        if images.is_empty() {
            println!("{}", style("The gallery is empty.").yellow());
            return Ok(None);
        }

        let labels: Vec<String> = images
            .iter()
            .map(|i| format!("{} ({})", i.display_name(), i.id))
            .collect();
        let index = Select::with_theme(&self.theme)
            .with_prompt(prompt)
            .items(&labels)
            .default(0)
            .interact()?;
        Ok(images.into_iter().nth(index))
    }

    fn show_links(&self) -> CliResult<()> {
        let Some(image) = self.pick_image("Image")? else {
            return Ok(());
        };

        let base = self.ctx.pipeline.settings().public_base_url.clone();
        let links = generate_image_links(&image.url);
        println!("{:<10} {}", style("URL").bold(), links.direct);
        println!("{:<10} {}", style("Markdown").bold(), links.markdown);
        println!("{:<10} {}", style("HTML").bold(), links.html);
        println!("{:<10} {}", style("BBCode").bold(), links.bbcode);

        for (label, variant) in [("Thumbnail", ImageVariant::Thumbnail), ("Medium", ImageVariant::Medium)] {
            let url = variant_url(&base, &image.url, variant);
            println!(
                "{:<10} {}",
                style(label).bold(),
                generate_link(&url, LinkFormat::Markdown, image.display_name())
            );
        }
        Ok(())
    }

    async fn delete_image(&self) -> CliResult<()> {
        let Some(image) = self.pick_image("Image to delete")? else {
            return Ok(());
        };

        if !Confirm::with_theme(&self.theme)
            .with_prompt(format!("Delete {}?", image.display_name()))
            .default(false)
            .interact()?
        {
            return Ok(());
        }

        if self.ctx.pipeline.delete_image(&image.url, &image.delete_token).await {
            println!("{}", style("Deleted.").green());
        } else {
            println!("{}", style("The host refused to delete the image.").red());
        }
        Ok(())
    }

    async fn set_token(&self) -> CliResult<()> {
        let username: String = Input::with_theme(&self.theme)
            .with_prompt("Username")
            .interact_text()?;

        if let Some(api) = &self.ctx.api {
            match api.check_username(username.trim()).await {
                Ok(true) => {}
                Ok(false) => println!(
                    "{}",
                    style(format!("The server does not know {}.", username.trim())).yellow()
                ),
                Err(e) => warn!("Could not check username: {}", e),
            }
        }

        let token = Password::with_theme(&self.theme)
            .with_prompt("Session token")
            .interact()?;

        match self.ctx.auth.login(username.trim(), token) {
            Ok(()) => println!("{}", style("Session saved.").green()),
            Err(e) => {
                warn!("Failed to save session: {}", e);
                println!("{}: {}", style("Could not save session").red().bold(), e);
            }
        }
        Ok(())
    }

    fn logout(&self) -> CliResult<()> {
        if let Err(e) = self.ctx.auth.logout() {
            println!("{}: {}", style("Could not clear session").red().bold(), e);
        }
        Ok(())
    }
}

/// Run the interactive menu until the user exits
pub async fn run_cli(ctx: CliContext) -> CliResult<()> {
    let cli_manager = CliManager::new(ctx)?;
    cli_manager.run().await
}
