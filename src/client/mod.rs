/// Line-based terminal player: find an opponent, then guess until the game ends
use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::core::protocol::{ClientMessage, HintView, MatchResponse, MatchStatus, Outcome, ServerMessage};

/// Ask the matchmaker for an opponent and return the session location
pub async fn find_match(url: &str) -> Result<String> {
    let (ws, _) = connect_async(url)
        .await
        .with_context(|| format!("Failed to reach matchmaker at {url}"))?;
    let (_, mut incoming) = ws.split();

    while let Some(frame) = incoming.next().await {
        let text = match frame? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let response: MatchResponse =
            serde_json::from_str(&text).context("Unexpected matchmaker response")?;
        println!("{}", response.message);

        match response.status {
            MatchStatus::Waiting => {}
            MatchStatus::Matched => {
                return response
                    .location
                    .ok_or_else(|| anyhow!("Matchmaker did not say where to play"));
            }
            MatchStatus::Timeout | MatchStatus::Error => bail!("{}", response.message),
        }
    }

    bail!("Matchmaker closed the connection")
}

/// Play one game at `location`, sending each stdin line as a guess.
/// Returns `None` if the game was left before it ended.
pub async fn play(location: &str) -> Result<Option<Outcome>> {
    let (ws, _) = connect_async(location)
        .await
        .with_context(|| format!("Failed to join game at {location}"))?;
    let (mut sink, mut incoming) = ws.split();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            frame = incoming.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => return Ok(None),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                };
                let message: ServerMessage = match serde_json::from_str(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        debug!("Ignoring unreadable frame: {}", e);
                        continue;
                    }
                };
                println!("{}", render(&message));
                if let ServerMessage::End { outcome, .. } = message {
                    let _ = sink.close().await;
                    return Ok(Some(outcome));
                }
            }

            line = lines.next_line() => {
                let Some(line) = line? else {
                    let _ = sink.close().await;
                    return Ok(None);
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match line.parse::<i64>() {
                    Ok(number) => {
                        let json = ClientMessage::Guess { number }.to_json()?;
                        sink.send(Message::Text(json)).await?;
                    }
                    Err(_) => println!("Please enter a whole number"),
                }
            }
        }
    }
}

/// Matchmaking followed by one game
pub async fn run(matchmaker_url: &str) -> Result<()> {
    let location = find_match(matchmaker_url).await?;
    println!("Joining game at {location}");
    match play(&location).await? {
        Some(Outcome::Win) => println!("Well played!"),
        Some(Outcome::Lose) => println!("Better luck next time."),
        None => println!("Left the game."),
    }
    Ok(())
}

fn render_hints(hints: &HintView) -> Option<String> {
    let mut facts = Vec::new();
    if let Some(even) = hints.is_even {
        facts.push(if even { "even".to_string() } else { "odd".to_string() });
    }
    if let Some(sum) = hints.digit_sum {
        facts.push(format!("digit sum {sum}"));
    }
    if let Some(prime) = hints.is_prime {
        facts.push(if prime { "prime".to_string() } else { "not prime".to_string() });
    }
    (!facts.is_empty()).then(|| format!("Hints: {}", facts.join(", ")))
}

/// Text shown to the player for a server frame
pub fn render(message: &ServerMessage) -> String {
    match message {
        ServerMessage::Waiting { message } => message.clone(),
        ServerMessage::Start { message, your_turn, min, max, hints }
        | ServerMessage::Update { message, your_turn, min, max, hints } => {
            let mut out = vec![message.clone(), format!("Range: {min}-{max}")];
            out.extend(render_hints(hints));
            if *your_turn {
                out.push("Your guess:".to_string());
            }
            out.join("\n")
        }
        ServerMessage::End { message, .. } => message.clone(),
        ServerMessage::Error { message } => format!("Error: {message}"),
    }
}
