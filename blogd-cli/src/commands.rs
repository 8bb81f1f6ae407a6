//! Command execution.

use crate::Commands;
use blogd_client::Client;
use blogd_protocol::BlogPost;
use colored::Colorize;
use std::fmt::Write as _;

/// Executes a command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Ping => {
            client.ping().await?;
            Ok("PONG".green().to_string())
        }

        Commands::Create {
            author,
            title,
            content,
        } => {
            let blog = client
                .create_blog(&BlogPost::new(author, title, content))
                .await?;
            Ok(format!("{} {}", "Created".green(), format_blog(&blog)))
        }

        Commands::Read { id } => {
            let blog = client.read_blog(&id).await?;
            Ok(format_blog(&blog))
        }

        Commands::Update {
            id,
            author,
            title,
            content,
        } => {
            let blog = client
                .update_blog(&BlogPost::new(author, title, content).with_id(id))
                .await?;
            Ok(format!("{} {}", "Updated".green(), format_blog(&blog)))
        }

        Commands::Delete { id } => {
            let deleted = client.delete_blog(&id).await?;
            Ok(format!("{} blog {}", "Deleted".green(), deleted.cyan()))
        }

        Commands::List { json } => {
            let mut stream = client.list_blogs().await?;
            let mut output = String::new();
            while let Some(blog) = stream.next().await {
                let blog = blog?;
                if json {
                    writeln!(output, "{}", serde_json::to_string(&blog)?)?;
                } else {
                    writeln!(output, "{}", format_blog(&blog))?;
                }
            }
            if json {
                return Ok(output.trim_end().to_string());
            }
            if stream.received() == 0 {
                return Ok("No blog posts".yellow().to_string());
            }
            write!(output, "{}", format!("({} posts)", stream.received()).dimmed())?;
            Ok(output)
        }

        Commands::Demo => demo(client).await,
    }
}

/// Walks one post through its whole lifecycle, printing each step.
async fn demo(client: &Client) -> Result<String, Box<dyn std::error::Error>> {
    let mut out = String::new();

    writeln!(out, "{}", "Creating the blog".bold())?;
    let created = client
        .create_blog(&BlogPost::new("Will", "Hello World", "This is working"))
        .await?;
    writeln!(out, "Blog has been created: {}", format_blog(&created))?;

    writeln!(out, "{}", "Reading the blog".bold())?;
    match client.read_blog("125sda589cweFewr9").await {
        Ok(blog) => writeln!(out, "Unexpected read: {}", format_blog(&blog))?,
        Err(e) => writeln!(out, "Bad id rejected: {}", e.to_string().yellow())?,
    }
    let read = client.read_blog(&created.id).await?;
    writeln!(out, "Blog was read: {}", format_blog(&read))?;

    writeln!(out, "{}", "Updating the blog".bold())?;
    let updated = client
        .update_blog(
            &BlogPost::new("James", "What's up", "Content has been changed")
                .with_id(created.id.clone()),
        )
        .await?;
    writeln!(out, "Blog was updated: {}", format_blog(&updated))?;

    writeln!(out, "{}", "Deleting the blog".bold())?;
    let deleted = client.delete_blog(&created.id).await?;
    writeln!(out, "Blog was deleted: {}", deleted.cyan())?;

    writeln!(out, "{}", "Listing blogs".bold())?;
    let mut stream = client.list_blogs().await?;
    while let Some(blog) = stream.next().await {
        writeln!(out, "  {}", format_blog(&blog?))?;
    }
    write!(out, "{}", format!("({} posts)", stream.received()).dimmed())?;

    Ok(out)
}

/// Formats a post on one line.
fn format_blog(blog: &BlogPost) -> String {
    format!(
        "{} author={} title={:?} content={:?}",
        blog.id.cyan(),
        blog.author_id,
        blog.title,
        blog.content
    )
}
