use std::io::{self, Write};

use bookshelf::model::BookView;
use bookshelf::parser::{self, Command, Condition};
use clap::Parser;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Interactive client for the bookshelf server", long_about = None)]
struct Args {
    #[clap(long, default_value = "http://127.0.0.1:4004")]
    server: String,
}

struct Session {
    client: Client,
    base: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    print_banner();

    let session = Session {
        client: Client::new(),
        base: args.server.trim_end_matches('/').to_string(),
    };

    match session.client.get(session.url("/books")).send().await {
        Ok(_) => println!("[\u{2713}] Connected to bookshelf at {}!", session.base),
        Err(_) => {
            println!("[\u{2717}] Could not connect to server at {}.", session.base);
            println!("    Make sure to run 'cargo run --release --bin bookshelf' in another terminal.");
            return;
        }
    }
    println!("Type 'HELP' for supported commands or 'EXIT' to quit.\n");

    let stdin = io::stdin();
    let mut buffer = String::new();

    loop {
        print!("books> ");
        let _ = io::stdout().flush();
        buffer.clear();

        match stdin.read_line(&mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        if buffer.trim().is_empty() { continue; }

        match parser::parse_command(&buffer) {
            Ok(Command::Exit) => break,
            Ok(cmd) => {
                if let Err(e) = session.execute(cmd).await {
                    println!("[\u{26a0}\u{fe0f} Error] {}", e);
                }
            }
            Err(e) => {
                println!("[\u{2717} Syntax Error] {}", e);
                if buffer.to_uppercase().starts_with("SELECT") {
                    println!("    \u{2139}\u{fe0f}  Hint: Try 'SELECT FROM BOOKS WHERE ID = 1 AS OF 1700000000000000'");
                }
            }
        }
    }
}

fn print_banner() {
    println!("\n==================================================");
    println!("   bookshelf CLI - system-versioned Books");
    println!("==================================================\n");
}

fn print_help() {
    println!("\n--- Available Commands ---");
    println!("1. INSERT:      INSERT INTO BOOKS VALUES (1, \"Title\", 5)");
    println!("2. LIST:        SELECT FROM BOOKS [WHERE TITLE LIKE \"x\" AND STOCK >= 2]");
    println!("3. GET:         GET 1");
    println!("4. TIME TRAVEL: SELECT FROM BOOKS WHERE ID = 1 AS OF 1700000000000000");
    println!("5. UPDATE:      UPDATE BOOKS SET TITLE = \"New\", STOCK = 3 WHERE ID = 1");
    println!("6. DELETE:      DELETE FROM BOOKS WHERE ID = 1");
    println!("7. HISTORY:     HISTORY [1]");
    println!("8. ADMIN:       VERIFY | CHECKPOINT");
    println!("9. EXIT:        Quit\n");
}

fn print_row(b: &BookView) {
    let end = b.valid_to.map_or_else(|| "PRESENT".to_string(), |t| t.to_string());
    println!("  #{:<6} {:<32} stock {:<6} | {} -> {}", b.id, format!("\"{}\"", b.title), b.stock, b.valid_from, end);
}

impl Session {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn execute(&self, cmd: Command) -> Result<(), String> {
        match cmd {
            Command::Help => { print_help(); Ok(()) },
            Command::Insert { id, title, stock } => {
                let res = self.send(self.client.post(self.url("/books")).json(&json!({ "ID": id, "title": title, "stock": stock }))).await?;
                let view: BookView = expect_json(res, StatusCode::CREATED).await?;
                println!("[\u{2713} OK] Inserted ID: {}", view.id);
                print_row(&view);
                Ok(())
            },

            // Route SELECT commands to either Time Travel, a single GET, or a filtered list
            Command::Select { filter, as_of } => {
                let id = filter.iter().find_map(|c| match c { Condition::Id(id) => Some(*id), _ => None });
                match (id, as_of) {
                    (Some(id), Some(ts)) => {
                        let res = self.send(self.client.get(self.url(&format!("/books/{}/as-of/{}", id, ts)))).await?;
                        let view: BookView = expect_json(res, StatusCode::OK).await?;
                        println!("[\u{23f1}\u{fe0f} Time Travel] Record state at {}:", ts);
                        print_row(&view);
                        Ok(())
                    }
                    (None, Some(_)) => Err("AS OF requires 'WHERE ID = ...'".into()),
                    (Some(id), None) => self.get(id).await,
                    (None, None) => self.list(&filter).await,
                }
            },

            Command::Update { id, title, stock } => {
                let mut body = serde_json::Map::new();
                if let Some(t) = title { body.insert("title".into(), Value::from(t)); }
                if let Some(s) = stock { body.insert("stock".into(), Value::from(s)); }
                let res = self.send(self.client.patch(self.url(&format!("/books/{}", id))).json(&body)).await?;
                let view: BookView = expect_json(res, StatusCode::OK).await?;
                println!("[\u{2713} OK] Updated ID: {}", view.id);
                print_row(&view);
                Ok(())
            },
            Command::Delete { id } => {
                let res = self.send(self.client.delete(self.url(&format!("/books/{}", id)))).await?;
                if res.status() == StatusCode::NO_CONTENT {
                    println!("[\u{2713} OK] Deleted ID: {}", id);
                    Ok(())
                } else {
                    Err(describe_error(res).await)
                }
            },
            Command::Get { id } => self.get(id).await,
            Command::History { id } => {
                let path = match id {
                    Some(id) => format!("/audit/books/{}", id),
                    None => "/audit/books".to_string(),
                };
                let res = self.send(self.client.get(self.url(&path))).await?;
                let rows: Vec<BookView> = expect_json(res, StatusCode::OK).await?;
                match id {
                    Some(id) => println!("History for {}:", id),
                    None => println!("History ({} archived versions):", rows.len()),
                }
                for (i, row) in rows.iter().enumerate() {
                    print!("  v{}", i + 1);
                    print_row(row);
                }
                Ok(())
            },
            Command::Verify => {
                let res = self.send(self.client.get(self.url("/admin/verify"))).await?;
                let report: Value = expect_json(res, StatusCode::OK).await?;
                if report["ok"].as_bool().unwrap_or(false) {
                    println!("[\u{2713}] All invariants hold.");
                } else {
                    println!("[\u{2717}] Violations: {}", report["violations"]);
                }
                Ok(())
            },
            Command::Checkpoint => {
                let res = self.send(self.client.post(self.url("/admin/checkpoint"))).await?;
                let _: Value = expect_json(res, StatusCode::OK).await?;
                println!("[\u{2713} OK] Journal checkpointed.");
                Ok(())
            },
            Command::Exit => Ok(()),
        }
    }

    async fn get(&self, id: i64) -> Result<(), String> {
        let res = self.send(self.client.get(self.url(&format!("/books/{}", id)))).await?;
        if res.status() == StatusCode::NOT_FOUND {
            println!("[\u{2717}] ID Not Found.");
            return Ok(());
        }
        let view: BookView = expect_json(res, StatusCode::OK).await?;
        print_row(&view);
        Ok(())
    }

    async fn list(&self, filter: &[Condition]) -> Result<(), String> {
        let mut query: Vec<(&str, String)> = Vec::new();
        for c in filter {
            match c {
                Condition::TitleLike(t) => query.push(("title", t.clone())),
                Condition::MinStock(s) => query.push(("min_stock", s.to_string())),
                Condition::Id(_) => {}
            }
        }
        let res = self.send(self.client.get(self.url("/books")).query(&query)).await?;
        let rows: Vec<BookView> = expect_json(res, StatusCode::OK).await?;
        println!("\nFound {} books:", rows.len());
        for row in &rows {
            print_row(row);
        }
        println!();
        Ok(())
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Response, String> {
        req.send().await.map_err(|e| e.to_string())
    }
}

async fn expect_json<T: serde::de::DeserializeOwned>(res: Response, ok: StatusCode) -> Result<T, String> {
    if res.status() != ok {
        return Err(describe_error(res).await);
    }
    res.json::<T>().await.map_err(|e| e.to_string())
}

async fn describe_error(res: Response) -> String {
    let status = res.status();
    match res.json::<Value>().await {
        Ok(body) => format!(
            "{} {}: {}{}",
            status.as_u16(),
            body["code"].as_str().unwrap_or("?"),
            body["message"].as_str().unwrap_or(""),
            if body["retryable"].as_bool() == Some(true) { " (retry later)" } else { "" }
        ),
        Err(_) => format!("Server Rejected Request ({})", status),
    }
}
