use super::protocol::BeanstalkCommand;

/// Types implementing BeanstalkSerialisable can be sent over the Beanstalk TCP
/// connection in the client -> server direction.
pub trait BeanstalkSerialisable {
    /// Converts the value in question to a Beanstalk command, including the
    /// trailing CRLF (and any data block that follows it).
    fn serialise_beanstalk(&self) -> Vec<u8>;
}

impl BeanstalkSerialisable for BeanstalkCommand {
    fn serialise_beanstalk(&self) -> Vec<u8> {
        use BeanstalkCommand::*;

        fn with_name(cmd: &[u8], tube: &[u8]) -> Vec<u8> {
            let mut r = Vec::with_capacity(cmd.len() + tube.len() + 3);
            r.extend_from_slice(cmd);
            r.push(b' ');
            r.extend_from_slice(tube);
            r.extend_from_slice(b"\r\n");
            r
        }

        match self {
            Put {
                pri,
                delay,
                ttr,
                data,
            } => {
                let mut r =
                    format!("put {pri} {delay} {ttr} {}\r\n", data.len())
                        .into_bytes();
                r.extend_from_slice(data);
                r.extend_from_slice(b"\r\n");
                r
            },
            ReserveWithTimeout { timeout } => {
                format!("reserve-with-timeout {timeout}\r\n").into_bytes()
            },
            Delete { id } => format!("delete {id}\r\n").into_bytes(),
            Bury { id, pri } => format!("bury {id} {pri}\r\n").into_bytes(),
            Watch { tube } => with_name(b"watch", tube),
            Ignore { tube } => with_name(b"ignore", tube),
            StatsTube { tube } => with_name(b"stats-tube", tube),
            Use { tube } => with_name(b"use", tube),
        }
    }
}
