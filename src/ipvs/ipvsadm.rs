use super::{IpvsHandle, LbError};
use crate::models::{Protocol, RealServer, SVC_F_PERSISTENT, VirtualServer};

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::process::Command;
use tracing::debug;

/// Drives the kernel IPVS table through the `ipvsadm` tool.
pub struct Ipvsadm {
    binary: String,
}

impl Ipvsadm {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn exec(&self, op: &str, args: &[String]) -> Result<String, LbError> {
        debug!("{} {}", self.binary, args.join(" "));
        let output = Command::new(&self.binary).args(args).output().await?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify(op, stderr))
    }

    async fn show(
        &self,
        vs: &VirtualServer,
    ) -> Result<Option<(VirtualServer, Vec<RealServer>)>, LbError> {
        let op = format!("list {}", vs);
        match self.exec(&op, &list_args(vs)).await {
            Ok(listing) => Ok(parse_listing(&listing, vs)),
            Err(LbError::NotFound(_)) => Ok(None),
            // older ipvsadm releases report a missing service this way
            Err(LbError::Rejected { reason, .. })
                if reason.contains("Memory allocation problem") =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl IpvsHandle for Ipvsadm {
    async fn get_virtual_server(&self, vs: &VirtualServer) -> Result<Option<VirtualServer>, LbError> {
        Ok(self.show(vs).await?.map(|(applied, _)| applied))
    }

    async fn add_virtual_server(&self, vs: &VirtualServer) -> Result<(), LbError> {
        self.exec(&vs.to_string(), &service_args("-A", vs)).await.map(|_| ())
    }

    async fn update_virtual_server(&self, vs: &VirtualServer) -> Result<(), LbError> {
        self.exec(&vs.to_string(), &service_args("-E", vs)).await.map(|_| ())
    }

    async fn delete_virtual_server(&self, vs: &VirtualServer) -> Result<(), LbError> {
        let args = vec!["-D".to_string(), protocol_flag(vs.protocol).to_string(), vs.endpoint().to_string()];
        self.exec(&vs.to_string(), &args).await.map(|_| ())
    }

    async fn list_real_servers(&self, vs: &VirtualServer) -> Result<Vec<RealServer>, LbError> {
        match self.show(vs).await? {
            Some((_, dests)) => Ok(dests),
            None => Err(LbError::NotFound(vs.to_string())),
        }
    }

    async fn add_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<(), LbError> {
        let op = format!("real server {}", rs);
        self.exec(&op, &dest_args("-a", vs, rs)).await.map(|_| ())
    }

    async fn update_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<(), LbError> {
        let op = format!("real server {}", rs);
        self.exec(&op, &dest_args("-e", vs, rs)).await.map(|_| ())
    }

    async fn delete_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<(), LbError> {
        let op = format!("real server {}", rs);
        let args = vec![
            "-d".to_string(),
            protocol_flag(vs.protocol).to_string(),
            vs.endpoint().to_string(),
            "-r".to_string(),
            rs.endpoint().to_string(),
        ];
        self.exec(&op, &args).await.map(|_| ())
    }
}

fn classify(op: &str, stderr: String) -> LbError {
    let lower = stderr.to_lowercase();
    if lower.contains("already exists") {
        LbError::AlreadyExists(op.to_string())
    } else if lower.contains("no such service")
        || lower.contains("no such destination")
        || lower.contains("does not exist")
    {
        LbError::NotFound(op.to_string())
    } else {
        LbError::rejected(op, stderr)
    }
}

fn protocol_flag(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Tcp => "-t",
        Protocol::Udp => "-u",
    }
}

fn list_args(vs: &VirtualServer) -> Vec<String> {
    vec![
        "-L".to_string(),
        "-n".to_string(),
        protocol_flag(vs.protocol).to_string(),
        vs.endpoint().to_string(),
    ]
}

fn service_args(cmd: &str, vs: &VirtualServer) -> Vec<String> {
    let mut args = vec![
        cmd.to_string(),
        protocol_flag(vs.protocol).to_string(),
        vs.endpoint().to_string(),
        "-s".to_string(),
        vs.scheduler.clone(),
    ];
    if vs.is_persistent() {
        args.push("-p".to_string());
        args.push(vs.timeout.to_string());
    }
    args
}

/// Members are always added in masquerading (NAT) mode.
fn dest_args(cmd: &str, vs: &VirtualServer, rs: &RealServer) -> Vec<String> {
    vec![
        cmd.to_string(),
        protocol_flag(vs.protocol).to_string(),
        vs.endpoint().to_string(),
        "-r".to_string(),
        rs.endpoint().to_string(),
        "-m".to_string(),
        "-w".to_string(),
        rs.weight.to_string(),
    ]
}

/// Extracts `vs` and its destinations from `ipvsadm -L -n` output.
fn parse_listing(listing: &str, vs: &VirtualServer) -> Option<(VirtualServer, Vec<RealServer>)> {
    let mut found: Option<(VirtualServer, Vec<RealServer>)> = None;
    let mut in_service = false;

    for line in listing.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = tokens.first() else {
            continue;
        };

        match *first {
            "TCP" | "UDP" => {
                in_service = false;
                let protocol = if *first == "TCP" { Protocol::Tcp } else { Protocol::Udp };
                let Some(endpoint) = tokens.get(1).and_then(|t| t.parse::<SocketAddr>().ok()) else {
                    continue;
                };
                if protocol != vs.protocol || endpoint != vs.endpoint() {
                    continue;
                }

                let scheduler = tokens.get(2).copied().unwrap_or_default();
                let mut applied = VirtualServer::new(endpoint, protocol, scheduler);
                if let Some(idx) = tokens.iter().position(|t| *t == "persistent") {
                    applied.flags |= SVC_F_PERSISTENT;
                    applied.timeout = tokens
                        .get(idx + 1)
                        .and_then(|t| t.parse().ok())
                        .unwrap_or_default();
                }
                found = Some((applied, Vec::new()));
                in_service = true;
            }
            "->" if in_service => {
                // header row reads "-> RemoteAddress:Port ..."
                let Some(endpoint) = tokens.get(1).and_then(|t| t.parse::<SocketAddr>().ok()) else {
                    continue;
                };
                let weight = tokens.get(3).and_then(|t| t.parse().ok()).unwrap_or(0);
                if let Some((_, dests)) = found.as_mut() {
                    dests.push(RealServer::new(endpoint).with_weight(weight));
                }
            }
            _ => {}
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
IP Virtual Server version 1.2.1 (size=4096)
Prot LocalAddress:Port Scheduler Flags
  -> RemoteAddress:Port           Forward Weight ActiveConn InActConn
TCP  10.10.10.10:6443 rr
  -> 192.168.0.2:6443             Masq    1      3          0
  -> 192.168.0.3:6443             Masq    0      0          5
";

    fn vip() -> VirtualServer {
        VirtualServer::new("10.10.10.10:6443".parse().unwrap(), Protocol::Tcp, "rr")
    }

    #[test]
    fn test_parse_listing() {
        let (applied, dests) = parse_listing(LISTING, &vip()).unwrap();
        assert_eq!(applied, vip());
        assert_eq!(dests.len(), 2);
        assert_eq!(dests[0].to_string(), "192.168.0.2:6443");
        assert_eq!(dests[0].weight, 1);
        assert_eq!(dests[1].weight, 0);
    }

    #[test]
    fn test_parse_listing_without_service() {
        let mut other = vip();
        other.port = 443;
        assert!(parse_listing(LISTING, &other).is_none());

        let mut udp = vip();
        udp.protocol = Protocol::Udp;
        assert!(parse_listing(LISTING, &udp).is_none());
    }

    #[test]
    fn test_parse_listing_persistent_ipv6() {
        let listing = "\
Prot LocalAddress:Port Scheduler Flags
  -> RemoteAddress:Port           Forward Weight ActiveConn InActConn
UDP  [fd00::10]:53 wlc persistent 360
  -> [fd00::2]:53                 Masq    2      0          0
";
        let vs = VirtualServer::new("[fd00::10]:53".parse().unwrap(), Protocol::Udp, "wlc")
            .with_persistence(360);
        let (applied, dests) = parse_listing(listing, &vs).unwrap();
        assert_eq!(applied, vs);
        assert!(!vs.drifted_from(&applied));
        assert_eq!(dests[0].to_string(), "[fd00::2]:53");
        assert_eq!(dests[0].weight, 2);
    }

    #[test]
    fn test_command_args() {
        let vs = vip().with_persistence(300);
        assert_eq!(
            service_args("-A", &vs).join(" "),
            "-A -t 10.10.10.10:6443 -s rr -p 300"
        );

        let rs = RealServer::new("192.168.0.2:6443".parse().unwrap());
        assert_eq!(
            dest_args("-a", &vip(), &rs).join(" "),
            "-a -t 10.10.10.10:6443 -r 192.168.0.2:6443 -m -w 1"
        );
    }

    #[test]
    fn test_classify_stderr() {
        assert!(matches!(
            classify("TCP 10.10.10.10:6443", "Service already exists".into()),
            LbError::AlreadyExists(_)
        ));
        assert!(matches!(
            classify("real server 192.168.0.2:6443", "No such destination".into()),
            LbError::NotFound(_)
        ));
        assert!(matches!(
            classify("TCP 10.10.10.10:6443", "Permission denied (you must be root)".into()),
            LbError::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let ipvsadm = Ipvsadm::new("/nonexistent/ipvsadm");
        let err = ipvsadm.get_virtual_server(&vip()).await.unwrap_err();
        assert!(matches!(err, LbError::Io(_)));
    }
}
