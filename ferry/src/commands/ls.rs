use anyhow::{Context, Result};
use ferry_common::{Command, DirEntry, ListCommand, ListFlags};
use url::Url;

use super::common::connect;

pub(crate) async fn command(cli: &crate::Cli, url: &Url) -> Result<()> {
    let (mut client, _) = connect(cli, url, None).await?;

    let list = match &client.site().remote_path {
        Some(path) => ListCommand::new(path.clone()),
        None => ListCommand::current(),
    };
    let list = ListCommand {
        flags: list.flags | ListFlags::REFRESH,
        ..list
    };
    let outcome = client.run(Command::List(list)).await?.check("Listing")?;

    let path = outcome
        .listing
        .context("The server sent no directory listing")?;
    let listing = client
        .context()
        .directory_cache
        .lookup(client.server_key(), &path)
        .context("The listing is missing from the cache")?;

    println!("{path}:");
    for entry in &listing.entries {
        println!("{}", format_entry(entry));
    }
    client.disconnect().await
}

fn format_entry(entry: &DirEntry) -> String {
    let kind = if entry.is_dir {
        'd'
    } else if entry.is_link {
        'l'
    } else {
        '-'
    };
    let size = if entry.size < 0 {
        String::new()
    } else {
        entry.size.to_string()
    };
    let time = entry
        .time
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default();
    let mut line = format!(
        "{kind} {:<10} {:>12} {:<16} {}",
        entry.permissions, size, time, entry.name
    );
    if let Some(target) = &entry.link_target {
        line.push_str(" -> ");
        line.push_str(target);
    }
    line
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    #[test]
    fn entries_look_like_ls() {
        let mut file = DirEntry::file("notes.txt", 1234);
        file.permissions = "rw-r--r--".into();
        file.time = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).single();
        assert_eq!(
            format_entry(&file),
            "- rw-r--r--          1234 2024-03-01 12:30 notes.txt"
        );

        let dir = DirEntry::dir("pub");
        assert!(format_entry(&dir).starts_with("d "));
        assert!(format_entry(&dir).ends_with(" pub"));

        let mut link = DirEntry::file("latest", -1);
        link.is_link = true;
        link.link_target = Some("releases/1.0".into());
        assert!(format_entry(&link).ends_with("latest -> releases/1.0"));
    }
}
