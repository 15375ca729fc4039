//! Interactive REPL-style command-line interface client.

use std::io::{self, Write};
use std::str::SplitWhitespace;

use color_print::{cprint, cprintln};

use tokio::time::Instant;

use checkpointd::{
    CheckpointdError, CkptAttributes, CkptHandle, CkptResult, CkptSession,
    CreationFlags, OpenFlags, SaTime, SectionsChosen, TIME_END,
};

/// Prompt string at the start of line.
const PROMPT: &str = ">>>>> ";

/// Recognizable command types.
#[derive(Debug, PartialEq, Eq)]
enum ReplCommand {
    Open {
        name: String,
        flags: OpenFlags,
        attrs: Option<CkptAttributes>,
    },
    Close(CkptHandle),
    Unlink(String),
    Create {
        ckpt: CkptHandle,
        id: String,
        data: String,
    },
    Delete {
        ckpt: CkptHandle,
        id: String,
    },
    Write {
        ckpt: CkptHandle,
        id: String,
        offset: u64,
        data: String,
    },
    Overwrite {
        ckpt: CkptHandle,
        id: String,
        data: String,
    },
    Read {
        ckpt: CkptHandle,
        id: String,
        offset: u64,
        size: u64,
    },
    Query(CkptHandle),
    Status(CkptHandle),
    Sync(CkptHandle),
    Active(CkptHandle),
    Retention {
        ckpt: CkptHandle,
        retention: SaTime,
    },
    Expire {
        ckpt: CkptHandle,
        id: String,
        expiration: SaTime,
    },

    /// Print help message.
    PrintHelp,

    /// Client exit.
    Exit,

    /// Nothing read.
    Nothing,
}

/// What a finished command printed as its result.
type Outcome = CkptResult<String>;

/// Interactive REPL-style client struct.
pub(crate) struct ClientRepl {
    session: CkptSession,

    /// User input buffer.
    input_buf: String,
}

impl ClientRepl {
    /// Creates a new REPL-style client over an initialized session.
    pub(crate) fn new(session: CkptSession) -> Self {
        ClientRepl {
            session,
            input_buf: String::new(),
        }
    }

    /// Prints the prompt string.
    fn print_prompt() -> Result<(), CheckpointdError> {
        cprint!("<bright-yellow>{}</>", PROMPT);
        io::stdout().flush()?;
        Ok(())
    }

    /// Prints (optionally) an error message and the help message.
    fn print_help(err: Option<&CheckpointdError>) {
        if let Some(e) = err {
            cprintln!("<bright-red>✗</> {}", e);
        }
        println!("HELP: Supported commands are:");
        println!("          open <name> <flags: r|w|c...> [new <max_sections> <max_section_size> <retention_ms> [active]]");
        println!("          close <ckpt>");
        println!("          unlink <name>");
        println!("          create <ckpt> <id> <data>");
        println!("          delete <ckpt> <id>");
        println!("          write <ckpt> <id> <offset> <data>");
        println!("          overwrite <ckpt> <id> <data>");
        println!("          read <ckpt> <id> [offset] [size]");
        println!("          query <ckpt>");
        println!("          status <ckpt>");
        println!("          sync <ckpt>");
        println!("          active <ckpt>");
        println!("          retention <ckpt> <ms|forever>");
        println!("          expire <ckpt> <id> <ms|forever>");
        println!("          help");
        println!("          exit");
        println!("      Ids and data currently cannot contain any whitespaces");
    }

    /// Expect to get the next segment string from parsed segs.
    fn expect_next_seg<'s>(
        segs: &mut SplitWhitespace<'s>,
    ) -> Result<&'s str, CheckpointdError> {
        segs.next()
            .ok_or_else(|| CheckpointdError::msg("not enough args"))
    }

    fn expect_handle(
        segs: &mut SplitWhitespace,
    ) -> Result<CkptHandle, CheckpointdError> {
        Ok(Self::expect_next_seg(segs)?.parse()?)
    }

    /// Parses a time interval in millisecs, or `forever`.
    fn parse_time(seg: &str) -> Result<SaTime, CheckpointdError> {
        if seg.eq_ignore_ascii_case("forever") {
            Ok(TIME_END)
        } else {
            let ms: i64 = seg.parse()?;
            Ok(ms.saturating_mul(1_000_000))
        }
    }

    fn parse_flags(seg: &str) -> Result<OpenFlags, CheckpointdError> {
        let mut flags = OpenFlags::default();
        for c in seg.chars() {
            match c.to_ascii_lowercase() {
                'r' => flags.read = true,
                'w' => flags.write = true,
                'c' => flags.colocated = true,
                _ => {
                    return Err(CheckpointdError::msg(format!(
                        "unknown open flag '{}'",
                        c
                    )))
                }
            }
        }
        Ok(flags)
    }

    fn parse_attrs(
        segs: &mut SplitWhitespace,
    ) -> Result<Option<CkptAttributes>, CheckpointdError> {
        match segs.next() {
            None => return Ok(None),
            Some(seg) if seg.eq_ignore_ascii_case("new") => {}
            Some(seg) => {
                return Err(CheckpointdError::msg(format!(
                    "unexpected arg '{}'",
                    seg
                )))
            }
        }
        let max_sections: u32 = Self::expect_next_seg(segs)?.parse()?;
        let max_section_size: u64 = Self::expect_next_seg(segs)?.parse()?;
        let retention = Self::parse_time(Self::expect_next_seg(segs)?)?;
        let creation_flags = match segs.next() {
            Some(seg) if seg.eq_ignore_ascii_case("active") => {
                CreationFlags::WriteActiveReplica
            }
            _ => CreationFlags::WriteAllReplicas,
        };
        Ok(Some(CkptAttributes {
            creation_flags,
            checkpoint_size: max_section_size
                .saturating_mul(u64::from(max_sections)),
            retention,
            max_sections,
            max_section_size,
            max_section_id_size: 64,
        }))
    }

    /// Parses one input line into a command.
    fn parse_command(line: &str) -> Result<ReplCommand, CheckpointdError> {
        let mut segs = line.split_whitespace();
        let cmd_type = match segs.next() {
            Some(seg) => seg.to_lowercase(),
            None => return Ok(ReplCommand::Nothing),
        };
        let segs = &mut segs;

        match &cmd_type[..] {
            "open" => {
                let name = Self::expect_next_seg(segs)?.to_string();
                let flags = Self::parse_flags(Self::expect_next_seg(segs)?)?;
                let attrs = Self::parse_attrs(segs)?;
                Ok(ReplCommand::Open { name, flags, attrs })
            }
            "close" => Ok(ReplCommand::Close(Self::expect_handle(segs)?)),
            "unlink" => Ok(ReplCommand::Unlink(
                Self::expect_next_seg(segs)?.to_string(),
            )),
            "create" => Ok(ReplCommand::Create {
                ckpt: Self::expect_handle(segs)?,
                id: Self::expect_next_seg(segs)?.to_string(),
                data: Self::expect_next_seg(segs)?.to_string(),
            }),
            "delete" => Ok(ReplCommand::Delete {
                ckpt: Self::expect_handle(segs)?,
                id: Self::expect_next_seg(segs)?.to_string(),
            }),
            "write" => Ok(ReplCommand::Write {
                ckpt: Self::expect_handle(segs)?,
                id: Self::expect_next_seg(segs)?.to_string(),
                offset: Self::expect_next_seg(segs)?.parse()?,
                data: Self::expect_next_seg(segs)?.to_string(),
            }),
            "overwrite" => Ok(ReplCommand::Overwrite {
                ckpt: Self::expect_handle(segs)?,
                id: Self::expect_next_seg(segs)?.to_string(),
                data: Self::expect_next_seg(segs)?.to_string(),
            }),
            "read" => {
                let ckpt = Self::expect_handle(segs)?;
                let id = Self::expect_next_seg(segs)?.to_string();
                let offset = match segs.next() {
                    Some(seg) => seg.parse()?,
                    None => 0,
                };
                let size = match segs.next() {
                    Some(seg) => seg.parse()?,
                    None => u64::MAX,
                };
                Ok(ReplCommand::Read {
                    ckpt,
                    id,
                    offset,
                    size,
                })
            }
            "query" => Ok(ReplCommand::Query(Self::expect_handle(segs)?)),
            "status" => Ok(ReplCommand::Status(Self::expect_handle(segs)?)),
            "sync" => Ok(ReplCommand::Sync(Self::expect_handle(segs)?)),
            "active" => Ok(ReplCommand::Active(Self::expect_handle(segs)?)),
            "retention" => Ok(ReplCommand::Retention {
                ckpt: Self::expect_handle(segs)?,
                retention: Self::parse_time(Self::expect_next_seg(segs)?)?,
            }),
            "expire" => Ok(ReplCommand::Expire {
                ckpt: Self::expect_handle(segs)?,
                id: Self::expect_next_seg(segs)?.to_string(),
                expiration: Self::parse_time(Self::expect_next_seg(segs)?)?,
            }),
            "help" => Ok(ReplCommand::PrintHelp),
            "exit" => Ok(ReplCommand::Exit),
            _ => Err(CheckpointdError::msg(format!(
                "unrecognized command: {}",
                cmd_type
            ))),
        }
    }

    /// Reads in user input and parses into a command.
    fn read_command(&mut self) -> Result<ReplCommand, CheckpointdError> {
        self.input_buf.clear();
        let nread = io::stdin().read_line(&mut self.input_buf)?;
        if nread == 0 {
            return Ok(ReplCommand::Exit);
        }
        let cmd = Self::parse_command(self.input_buf.trim());
        if let Err(ref e) = cmd {
            Self::print_help(Some(e));
        }
        cmd
    }

    /// Issues the command to the daemon and waits for the reply.
    async fn eval_command(
        &mut self,
        cmd: ReplCommand,
    ) -> Result<Outcome, CheckpointdError> {
        let s = &mut self.session;
        let done = |r: CkptResult<()>| r.map(|()| "ok".to_string());
        Ok(match cmd {
            ReplCommand::Open { name, flags, attrs } => s
                .open(&name, flags, attrs)
                .await?
                .map(|h| format!("handle {}", h)),
            ReplCommand::Close(ckpt) => done(s.close(ckpt).await?),
            ReplCommand::Unlink(name) => done(s.unlink(&name).await?),
            ReplCommand::Create { ckpt, id, data } => done(
                s.section_create(ckpt, id.as_bytes(), TIME_END, data.as_bytes())
                    .await?,
            ),
            ReplCommand::Delete { ckpt, id } => {
                done(s.section_delete(ckpt, id.as_bytes()).await?)
            }
            ReplCommand::Write {
                ckpt,
                id,
                offset,
                data,
            } => done(
                s.write(ckpt, id.as_bytes(), offset, data.as_bytes())
                    .await?,
            ),
            ReplCommand::Overwrite { ckpt, id, data } => done(
                s.overwrite(ckpt, id.as_bytes(), data.as_bytes()).await?,
            ),
            ReplCommand::Read {
                ckpt,
                id,
                offset,
                size,
            } => s
                .read(ckpt, id.as_bytes(), offset, size)
                .await?
                .map(|data| format!("{:?}", String::from_utf8_lossy(&data))),
            ReplCommand::Query(ckpt) => s
                .section_iter(ckpt, SectionsChosen::Any, 0)
                .await?
                .map(|iter| {
                    iter.map(|d| {
                        format!(
                            "{}({}B)",
                            String::from_utf8_lossy(&d.id),
                            d.size
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(" ")
                }),
            ReplCommand::Status(ckpt) => {
                s.status_get(ckpt).await?.map(|st| format!("{:?}", st))
            }
            ReplCommand::Sync(ckpt) => done(s.synchronize(ckpt).await?),
            ReplCommand::Active(ckpt) => done(s.active_set(ckpt).await?),
            ReplCommand::Retention { ckpt, retention } => {
                done(s.retention_set(ckpt, retention).await?)
            }
            ReplCommand::Expire {
                ckpt,
                id,
                expiration,
            } => done(
                s.expiration_set(ckpt, id.as_bytes(), expiration).await?,
            ),
            ReplCommand::PrintHelp | ReplCommand::Exit | ReplCommand::Nothing => {
                return Err(CheckpointdError::msg("not a daemon command"))
            }
        })
    }

    /// One iteration of the REPL loop.
    async fn iter(&mut self) -> Result<bool, CheckpointdError> {
        Self::print_prompt()?;

        match self.read_command()? {
            ReplCommand::Exit => {
                println!("Exiting...");
                Ok(false)
            }
            ReplCommand::Nothing => Ok(true),
            ReplCommand::PrintHelp => {
                Self::print_help(None);
                Ok(true)
            }
            cmd => {
                let issue_ts = Instant::now();
                let outcome = self.eval_command(cmd).await?;
                let lat_ms = issue_ts.elapsed().as_secs_f64() * 1000.0;
                match outcome {
                    Ok(text) => cprintln!(
                        "<bright-green>✓</> {} <<took {:.2} ms>>",
                        text,
                        lat_ms
                    ),
                    Err(e) => cprintln!("<bright-red>✗</> {}", e),
                }
                Ok(true)
            }
        }
    }

    /// Runs the REPL loop until exit, then finalizes the session.
    pub(crate) async fn run(mut self) -> Result<(), CheckpointdError> {
        loop {
            match self.iter().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => cprintln!("<bright-red>✗</> {}", e),
            }
        }
        if let Err(e) = self.session.finalize().await? {
            cprintln!("<bright-red>✗</> finalize: {}", e);
        }
        self.session.leave().await
    }
}
