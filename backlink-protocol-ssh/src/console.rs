use std::net::SocketAddr;

use backlink_core::auth::Privilege;
use backlink_core::Services;
use uuid::Uuid;

/// Line console served to operators on session channels. It exists so
/// an operator can enumerate and manage the agents reachable through
/// this relay without any further tooling.
pub struct Console {
    username: String,
    privilege: Privilege,
    buffer: String,
}

/// What the handler should do with the channel after feeding input.
#[derive(Debug, Default, PartialEq)]
pub struct ConsoleOutput {
    /// Bytes to echo back when the operator requested a PTY.
    pub echo: String,
    /// Command output, already `\r\n`-terminated.
    pub output: String,
    pub close: bool,
}

impl Console {
    pub fn new(username: String, privilege: Privilege) -> Self {
        Self {
            username,
            privilege,
            buffer: String::new(),
        }
    }

    pub fn banner(&self) -> String {
        format!(
            "backlink relay. type 'help' for commands.\r\n{}",
            Self::PROMPT
        )
    }

    const PROMPT: &'static str = "backlink> ";

    /// Feed raw channel bytes through the line editor, running any
    /// completed command.
    pub async fn feed(&mut self, services: &Services, data: &[u8]) -> ConsoleOutput {
        let mut result = ConsoleOutput::default();

        for &byte in data {
            match byte {
                b'\r' | b'\n' => {
                    let line = std::mem::take(&mut self.buffer);
                    result.echo.push_str("\r\n");
                    let (output, close) = self.run_command(services, line.trim()).await;
                    result.output.push_str(&output);
                    result.close = close;
                    if close {
                        break;
                    }
                    result.output.push_str(Self::PROMPT);
                }
                0x7f | 0x08 => {
                    if self.buffer.pop().is_some() {
                        result.echo.push_str("\x08 \x08");
                    }
                }
                byte if byte >= 0x20 => {
                    let ch = byte as char;
                    self.buffer.push(ch);
                    result.echo.push(ch);
                }
                _ => {}
            }
        }

        result
    }

    /// Execute one command line, as used by both the interactive loop
    /// and `exec` requests. Returns the output and whether the channel
    /// should close.
    pub async fn run_command(&self, services: &Services, line: &str) -> (String, bool) {
        let mut args = line.split_whitespace();
        match args.next() {
            None => (String::new(), false),
            Some("help") => (
                "ls                       list reachable agents\r\n\
                 kill <id>                disconnect an agent\r\n\
                 bind <port> <host:port>  route agent dial-outs for a port\r\n\
                 unbind <port>            drop a dial-out route\r\n\
                 exit                     close this session\r\n"
                    .to_string(),
                false,
            ),
            Some("ls") => (self.list_agents(services).await, false),
            Some("kill") => (self.kill_agent(services, args.next()).await, false),
            Some("bind") => (
                self.bind_forward(services, args.next(), args.next()).await,
                false,
            ),
            Some("unbind") => (self.unbind_forward(services, args.next()).await, false),
            Some("exit") | Some("quit") => (String::new(), true),
            Some(other) => (
                format!("unknown command {other:?}, try 'help'\r\n"),
                false,
            ),
        }
    }

    fn is_admin(&self) -> bool {
        self.privilege == Privilege::Admin
    }

    async fn list_agents(&self, services: &Services) -> String {
        let mut out = format!(
            "{:<36} {:<16} {:<21} {}\r\n",
            "ID", "USER", "ADDRESS", "VERSION"
        );
        let mut count = 0;
        for record in services.registry.list().await {
            if !self.is_admin() && !record.visible_to(&self.username) {
                continue;
            }
            count += 1;
            out.push_str(&format!(
                "{:<36} {:<16} {:<21} {}\r\n",
                record.id, record.username, record.remote_addr, record.client_version
            ));
        }
        out.push_str(&format!("{count} agents\r\n"));
        out
    }

    async fn kill_agent(&self, services: &Services, id: Option<&str>) -> String {
        let Some(id) = id else {
            return "usage: kill <id>\r\n".to_string();
        };
        let Ok(id) = id.parse::<Uuid>() else {
            return format!("not an agent id: {id:?}\r\n");
        };
        let Some(record) = services.registry.get(id).await else {
            return format!("unknown agent: {id}\r\n");
        };
        if !self.is_admin() && !record.visible_to(&self.username) {
            return format!("unknown agent: {id}\r\n");
        }

        record.handle.close();
        format!("disconnecting {id}\r\n")
    }

    /// Route agent-offered `forwarded-tcpip` opens for one port to a
    /// server-local destination.
    async fn bind_forward(
        &self,
        services: &Services,
        port: Option<&str>,
        target: Option<&str>,
    ) -> String {
        if !self.is_admin() {
            return "permission denied\r\n".to_string();
        }
        let (Some(port), Some(target)) = (port, target) else {
            return "usage: bind <port> <host:port>\r\n".to_string();
        };
        let Ok(port) = port.parse::<u32>() else {
            return format!("not a port: {port:?}\r\n");
        };
        let Ok(target) = target.parse::<SocketAddr>() else {
            return format!("not an address: {target:?}\r\n");
        };

        services.forwards.bind(port, target).await;
        format!("routing agent dial-outs for port {port} to {target}\r\n")
    }

    async fn unbind_forward(&self, services: &Services, port: Option<&str>) -> String {
        if !self.is_admin() {
            return "permission denied\r\n".to_string();
        }
        let Some(port) = port else {
            return "usage: unbind <port>\r\n".to_string();
        };
        let Ok(port) = port.parse::<u32>() else {
            return format!("not a port: {port:?}\r\n");
        };

        services.forwards.unbind(port).await;
        format!("unbound {port}\r\n")
    }
}
