use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;

use shelf::config::Config;
use shelf::error::OperationError;
use shelf::library::{Book, LibraryClient, Route};
use shelf::session::SqliteTokenStore;

#[derive(Parser, Debug)]
#[command(name = "shelf")]
#[command(about = "Browse, borrow, and return books from a library catalog")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shelf/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Catalog endpoint, overriding the config file and SHELF_ENDPOINT
  #[arg(short, long)]
  endpoint: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List every book
  Books,
  /// Show one book and whether it is checked out
  Book { id: String },
  /// List every author
  Authors,
  /// Show an author and their books
  Author { id: String },
  /// Show your profile and borrowed books
  Me,
  /// Log in (password from SHELF_PASSWORD when omitted)
  Login {
    username: String,
    password: Option<String>,
  },
  /// Create an account and log in
  Signup {
    username: String,
    password: Option<String>,
  },
  /// Log out and forget everything cached
  Logout,
  /// Borrow a book
  Borrow { id: String },
  /// Return a borrowed book
  Return { id: String },
  /// Add a book to an author's catalog
  CreateBook {
    #[arg(long)]
    title: String,
    /// Author id
    #[arg(long)]
    author: String,
  },
  /// Delete a book
  DeleteBook { id: String },
  /// Show the page at a path, e.g. /books/<id>
  Open { path: String },
}

impl Command {
  /// Whether the command needs a signed-in session.
  fn requires_session(&self) -> bool {
    matches!(
      self,
      Command::Me
        | Command::Borrow { .. }
        | Command::Return { .. }
        | Command::CreateBook { .. }
        | Command::DeleteBook { .. }
    )
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Override endpoint if specified on command line
  if let Some(endpoint) = args.endpoint {
    config.endpoint = endpoint;
  }

  // Logging is best effort; the commands work without it.
  let _log_guard = match shelf::logging::init(&config.log) {
    Ok(guard) => Some(guard),
    Err(e) => {
      eprintln!("warning: logging disabled: {}", e);
      None
    }
  };

  let tokens = match &config.token_db {
    Some(path) => SqliteTokenStore::open(path)?,
    None => SqliteTokenStore::open_default()?,
  };
  let client = LibraryClient::new(&config, Arc::new(tokens))?;
  client.restore_session().await;

  if let Err(report) = run(&client, args.command).await {
    // Refusals are answers, not failures; show just the server's words.
    if let Some(OperationError::Rejected(message)) = report.downcast_ref::<OperationError>() {
      eprintln!("{}", message);
      std::process::exit(1);
    }
    return Err(report);
  }

  Ok(())
}

async fn run(client: &LibraryClient, command: Command) -> Result<()> {
  if command.requires_session() && !client.is_authenticated() {
    return Err(eyre!("You need to log in first: shelf login <username>"));
  }

  match command {
    Command::Books => print_books(&client.books().await?),
    Command::Book { id } => show(client, Route::Book(id)).await?,
    Command::Authors => show(client, Route::Authors).await?,
    Command::Author { id } => show(client, Route::Author(id)).await?,
    Command::Me => show(client, Route::Profile).await?,
    Command::Login { username, password } => {
      let password = password.map_or_else(Config::get_password, Ok)?;
      let user = client.login(&username, &password).await?;
      println!("Logged in as {}", user.username);
    }
    Command::Signup { username, password } => {
      let password = password.map_or_else(Config::get_password, Ok)?;
      let user = client.signup(&username, &password).await?;
      println!("Welcome, {}", user.username);
    }
    Command::Logout => {
      client.logout()?;
      println!("Logged out");
    }
    Command::Borrow { id } => {
      let result = client.borrow(&id).await?;
      for book in result.books {
        println!("Borrowed {}", book.title);
      }
    }
    Command::Return { id } => {
      let result = client.return_book(&id).await?;
      println!("{}", result.message.as_deref().unwrap_or("Returned"));
    }
    Command::CreateBook { title, author } => {
      let book = client.create_book(&title, &author).await?;
      println!("Created {} ({})", book.title, book.id);
    }
    Command::DeleteBook { id } => {
      let next = client.delete_book(&id).await?;
      println!("Deleted {}", id);
      show(client, next).await?;
    }
    Command::Open { path } => show(client, Route::parse(&path)).await?,
  }

  Ok(())
}

/// Render the page for a route.
async fn show(client: &LibraryClient, route: Route) -> Result<()> {
  if !client.allows(&route) {
    return Err(eyre!("{} requires logging in", route));
  }

  match route {
    Route::Books => print_books(&client.books().await?),
    Route::Book(id) => match client.book(&id).await? {
      Some(book) => print_book(&book),
      None => println!("Book Not Found"),
    },
    Route::Authors => {
      for author in client.authors().await? {
        println!("{}  {}", author.id, author.name);
      }
    }
    Route::Author(id) => match client.author(&id).await? {
      Some(author) => {
        println!("{}", author.name);
        println!("Books");
        for book in author.books {
          println!("  {}  {}", book.id, book.title);
        }
      }
      None => println!("Author Not Found"),
    },
    Route::Profile => match client.me().await? {
      Some(me) => {
        println!("Hello {}!", me.username);
        println!("List of Borrowed Books");
        for book in me.books {
          println!("  {}  {}", book.id, book.title);
        }
      }
      None => println!("Not logged in"),
    },
    Route::Login => println!("Log in with: shelf login <username>"),
    Route::Signup => println!("Sign up with: shelf signup <username>"),
    Route::NotFound(path) => {
      return Err(eyre!("Could not find the page you were looking for: {}", path))
    }
  }

  Ok(())
}

fn print_books(books: &[Book]) {
  for book in books {
    println!("{}  {} by {}", book.id, book.title, book.author.name);
  }
}

fn print_book(book: &Book) {
  println!("{}", book.title);
  println!("By: {}", book.author.name);
  match book.is_booked {
    Some(true) => println!("Already Checked Out"),
    Some(false) => println!("Not Checked Out"),
    None => {}
  }
}
