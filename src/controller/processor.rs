//! Command dispatcher: request in, typed response out.
//!
//! Each command entry fixes its arity (or variadic tail), its argument
//! decoders, the core call, and the response shape. The modifying-command
//! set and the TTL normalization used during WAL replay live next to the
//! table so the three stay in sync.

use crate::core::{Core, CoreError};
use crate::message::{now_unix_secs, ArgError, Request, Response};
use bytes::Bytes;
use std::sync::Arc;

/// Maps requests to core operations.
#[derive(Clone)]
pub struct Processor {
    core: Arc<Core>,
}

impl Processor {
    pub fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    /// Executes one command. Unknown names, arity mismatches, and argument
    /// parse failures never reach the core.
    pub fn process(&self, request: &Request) -> Response {
        match request.cmd.as_str() {
            "KEYS" => self.cmd_keys(request),
            "GET" => self.cmd_get(request),
            "SET" => self.cmd_set(request),
            "SETEX" => self.cmd_setex(request),
            "DEL" => self.cmd_del(request),
            "HSET" => self.cmd_hset(request),
            "HGET" => self.cmd_hget(request),
            "HKEYS" => self.cmd_hkeys(request),
            "HGETALL" => self.cmd_hgetall(request),
            "HDEL" => self.cmd_hdel(request),
            "LLEN" => self.cmd_llen(request),
            "LRANGE" => self.cmd_lrange(request),
            "LINDEX" => self.cmd_lindex(request),
            "LSET" => self.cmd_lset(request),
            "LPUSH" => self.cmd_lpush(request),
            "LPOP" => self.cmd_lpop(request),
            "TTL" => self.cmd_ttl(request),
            "EXPIRE" => self.cmd_expire(request),
            "PERSIST" => self.cmd_persist(request),
            _ => Response::invalid_command(format!("unknown command '{}'", request.cmd)),
        }
    }

    /// True when the command changes the storage and therefore belongs in
    /// the write-ahead log. The set is fixed by design.
    pub fn is_modifying(&self, request: &Request) -> bool {
        matches!(
            request.cmd.as_str(),
            "SET" | "SETEX" | "DEL" | "HSET" | "HDEL" | "LSET" | "LPUSH" | "LPOP" | "EXPIRE"
                | "PERSIST"
        )
    }

    /// Rewrites the TTL argument of SETEX and EXPIRE to the residual value
    /// `original - (now - request timestamp)`. Only used during WAL
    /// replay, where the stored TTL was chosen at the original write time.
    pub fn normalize_ttl(&self, request: &mut Request) -> Result<(), ArgError> {
        match request.cmd.as_str() {
            "SETEX" | "EXPIRE" => {
                let seconds = request.arg_int(1)?;
                let remaining = seconds - (now_unix_secs() - request.timestamp);
                request.args[1] = Bytes::from(remaining.to_string().into_bytes());
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn cmd_keys(&self, r: &Request) -> Response {
        if r.len() != 1 {
            return arity_error("KEYS");
        }
        let pattern = match r.arg_str(0) {
            Ok(p) => p,
            Err(e) => return argument_error("KEYS", &e),
        };
        Response::StrSlice(strings_to_bytes(self.core.keys(pattern)))
    }

    fn cmd_get(&self, r: &Request) -> Response {
        if r.len() != 1 {
            return arity_error("GET");
        }
        let key = match r.arg_str(0) {
            Ok(k) => k,
            Err(e) => return argument_error("GET", &e),
        };
        match self.core.get(key) {
            Ok(value) => Response::Str(value),
            Err(e) => core_error("GET", e),
        }
    }

    fn cmd_set(&self, r: &Request) -> Response {
        // Exactly two arguments: SET with inline EX/PX is not supported,
        // SETEX is the way to set a TTL.
        if r.len() != 2 {
            return arity_error("SET");
        }
        let key = match r.arg_str(0) {
            Ok(k) => k,
            Err(e) => return argument_error("SET", &e),
        };
        let value = match r.arg_bytes(1) {
            Ok(v) => v,
            Err(e) => return argument_error("SET", &e),
        };
        self.core.set(key, value);
        Response::ok()
    }

    fn cmd_setex(&self, r: &Request) -> Response {
        if r.len() != 3 {
            return arity_error("SETEX");
        }
        let key = match r.arg_str(0) {
            Ok(k) => k,
            Err(e) => return argument_error("SETEX", &e),
        };
        let seconds = match r.arg_int(1) {
            Ok(s) => s,
            Err(e) => return argument_error("SETEX", &e),
        };
        let value = match r.arg_bytes(2) {
            Ok(v) => v,
            Err(e) => return argument_error("SETEX", &e),
        };
        self.core.set_ex(key, seconds, value);
        Response::ok()
    }

    fn cmd_del(&self, r: &Request) -> Response {
        let keys = match r.tail_strings(0) {
            Ok(keys) => keys,
            Err(e) => return argument_error("DEL", &e),
        };
        Response::Int(self.core.del(&keys))
    }

    fn cmd_hset(&self, r: &Request) -> Response {
        if r.len() != 3 {
            return arity_error("HSET");
        }
        let key = match r.arg_str(0) {
            Ok(k) => k,
            Err(e) => return argument_error("HSET", &e),
        };
        let field = match r.arg_str(1) {
            Ok(f) => f,
            Err(e) => return argument_error("HSET", &e),
        };
        let value = match r.arg_bytes(2) {
            Ok(v) => v,
            Err(e) => return argument_error("HSET", &e),
        };
        match self.core.dict_set(key, field, value) {
            Ok(count) => Response::Int(count),
            Err(e) => core_error("HSET", e),
        }
    }

    fn cmd_hget(&self, r: &Request) -> Response {
        if r.len() != 2 {
            return arity_error("HGET");
        }
        let key = match r.arg_str(0) {
            Ok(k) => k,
            Err(e) => return argument_error("HGET", &e),
        };
        let field = match r.arg_str(1) {
            Ok(f) => f,
            Err(e) => return argument_error("HGET", &e),
        };
        match self.core.dict_get(key, field) {
            Ok(value) => Response::Str(value),
            Err(e) => core_error("HGET", e),
        }
    }

    fn cmd_hkeys(&self, r: &Request) -> Response {
        if r.len() != 1 {
            return arity_error("HKEYS");
        }
        let key = match r.arg_str(0) {
            Ok(k) => k,
            Err(e) => return argument_error("HKEYS", &e),
        };
        match self.core.dict_keys(key) {
            Ok(fields) => Response::StrSlice(strings_to_bytes(fields)),
            Err(e) => core_error("HKEYS", e),
        }
    }

    fn cmd_hgetall(&self, r: &Request) -> Response {
        if r.len() != 1 {
            return arity_error("HGETALL");
        }
        let key = match r.arg_str(0) {
            Ok(k) => k,
            Err(e) => return argument_error("HGETALL", &e),
        };
        match self.core.dict_get_all(key) {
            Ok(pairs) => Response::StrSlice(pairs),
            Err(e) => core_error("HGETALL", e),
        }
    }

    fn cmd_hdel(&self, r: &Request) -> Response {
        if r.len() < 2 {
            return arity_error("HDEL");
        }
        let key = match r.arg_str(0) {
            Ok(k) => k,
            Err(e) => return argument_error("HDEL", &e),
        };
        let fields = match r.tail_strings(1) {
            Ok(fields) => fields,
            Err(e) => return argument_error("HDEL", &e),
        };
        match self.core.dict_del(key, &fields) {
            Ok(count) => Response::Int(count),
            Err(e) => core_error("HDEL", e),
        }
    }

    fn cmd_llen(&self, r: &Request) -> Response {
        if r.len() != 1 {
            return arity_error("LLEN");
        }
        let key = match r.arg_str(0) {
            Ok(k) => k,
            Err(e) => return argument_error("LLEN", &e),
        };
        match self.core.list_len(key) {
            Ok(len) => Response::Int(len),
            Err(e) => core_error("LLEN", e),
        }
    }

    fn cmd_lrange(&self, r: &Request) -> Response {
        if r.len() != 3 {
            return arity_error("LRANGE");
        }
        let key = match r.arg_str(0) {
            Ok(k) => k,
            Err(e) => return argument_error("LRANGE", &e),
        };
        let start = match r.arg_int(1) {
            Ok(s) => s,
            Err(e) => return argument_error("LRANGE", &e),
        };
        let stop = match r.arg_int(2) {
            Ok(s) => s,
            Err(e) => return argument_error("LRANGE", &e),
        };
        match self.core.list_range(key, start, stop) {
            Ok(values) => Response::StrSlice(values),
            Err(e) => core_error("LRANGE", e),
        }
    }

    fn cmd_lindex(&self, r: &Request) -> Response {
        if r.len() != 2 {
            return arity_error("LINDEX");
        }
        let key = match r.arg_str(0) {
            Ok(k) => k,
            Err(e) => return argument_error("LINDEX", &e),
        };
        let index = match r.arg_int(1) {
            Ok(i) => i,
            Err(e) => return argument_error("LINDEX", &e),
        };
        match self.core.list_index(key, index) {
            Ok(value) => Response::Str(value),
            Err(e) => core_error("LINDEX", e),
        }
    }

    fn cmd_lset(&self, r: &Request) -> Response {
        if r.len() != 3 {
            return arity_error("LSET");
        }
        let key = match r.arg_str(0) {
            Ok(k) => k,
            Err(e) => return argument_error("LSET", &e),
        };
        let index = match r.arg_int(1) {
            Ok(i) => i,
            Err(e) => return argument_error("LSET", &e),
        };
        let value = match r.arg_bytes(2) {
            Ok(v) => v,
            Err(e) => return argument_error("LSET", &e),
        };
        match self.core.list_set(key, index, value) {
            Ok(()) => Response::ok(),
            Err(e) => core_error("LSET", e),
        }
    }

    fn cmd_lpush(&self, r: &Request) -> Response {
        if r.len() < 2 {
            return arity_error("LPUSH");
        }
        let key = match r.arg_str(0) {
            Ok(k) => k,
            Err(e) => return argument_error("LPUSH", &e),
        };
        let values = match r.tail_bytes(1) {
            Ok(values) => values,
            Err(e) => return argument_error("LPUSH", &e),
        };
        match self.core.list_push(key, values) {
            Ok(len) => Response::Int(len),
            Err(e) => core_error("LPUSH", e),
        }
    }

    fn cmd_lpop(&self, r: &Request) -> Response {
        if r.len() != 1 {
            return arity_error("LPOP");
        }
        let key = match r.arg_str(0) {
            Ok(k) => k,
            Err(e) => return argument_error("LPOP", &e),
        };
        match self.core.list_pop(key) {
            Ok(value) => Response::Str(value),
            Err(e) => core_error("LPOP", e),
        }
    }

    fn cmd_ttl(&self, r: &Request) -> Response {
        if r.len() != 1 {
            return arity_error("TTL");
        }
        let key = match r.arg_str(0) {
            Ok(k) => k,
            Err(e) => return argument_error("TTL", &e),
        };
        Response::Int(self.core.ttl(key))
    }

    fn cmd_expire(&self, r: &Request) -> Response {
        if r.len() != 2 {
            return arity_error("EXPIRE");
        }
        let key = match r.arg_str(0) {
            Ok(k) => k,
            Err(e) => return argument_error("EXPIRE", &e),
        };
        let seconds = match r.arg_int(1) {
            Ok(s) => s,
            Err(e) => return argument_error("EXPIRE", &e),
        };
        Response::Int(self.core.expire(key, seconds))
    }

    fn cmd_persist(&self, r: &Request) -> Response {
        if r.len() != 1 {
            return arity_error("PERSIST");
        }
        let key = match r.arg_str(0) {
            Ok(k) => k,
            Err(e) => return argument_error("PERSIST", &e),
        };
        Response::Int(self.core.persist(key))
    }
}

fn arity_error(cmd: &str) -> Response {
    Response::invalid_arguments(format!("wrong number of arguments for '{cmd}' command"))
}

fn argument_error(cmd: &str, err: &ArgError) -> Response {
    Response::invalid_arguments(format!("{cmd}: {err}"))
}

fn core_error(cmd: &str, err: CoreError) -> Response {
    match err {
        CoreError::NotFound => Response::not_found(format!("{cmd}: {err}")),
        CoreError::WrongType => Response::wrong_type(format!("{cmd}: {err}")),
        CoreError::NoSuchKey | CoreError::InvalidIndex => Response::error(err.to_string()),
    }
}

fn strings_to_bytes(strings: Vec<String>) -> Vec<Bytes> {
    strings
        .into_iter()
        .map(|s| Bytes::from(s.into_bytes()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CoreConfig;
    use crate::message::Status;

    fn processor() -> Processor {
        Processor::new(Arc::new(Core::new(CoreConfig::default())))
    }

    fn request(cmd: &str, args: &[&str]) -> Request {
        Request::new(
            cmd,
            args.iter().map(|a| Bytes::copy_from_slice(a.as_bytes())).collect(),
        )
    }

    #[test]
    fn set_then_get() {
        let p = processor();
        assert_eq!(p.process(&request("set", &["k", "v"])), Response::ok());
        assert_eq!(
            p.process(&request("GET", &["k"])),
            Response::Str(Bytes::from("v"))
        );
    }

    #[test]
    fn get_missing_is_not_found() {
        let p = processor();
        assert_eq!(p.process(&request("GET", &["404"])).status(), Status::NotFound);
    }

    #[test]
    fn wrong_type_maps_to_type_mismatch() {
        let p = processor();
        p.process(&request("SET", &["k", "v"]));
        assert_eq!(
            p.process(&request("HGET", &["k", "f"])).status(),
            Status::TypeMismatch
        );
    }

    #[test]
    fn unknown_command() {
        let p = processor();
        assert_eq!(
            p.process(&request("FLY", &["away"])).status(),
            Status::InvalidCommand
        );
    }

    #[test]
    fn arity_is_enforced() {
        let p = processor();
        assert_eq!(p.process(&request("GET", &[])).status(), Status::InvalidArguments);
        assert_eq!(
            p.process(&request("GET", &["a", "b"])).status(),
            Status::InvalidArguments
        );
        // SET with inline TTL options is rejected.
        assert_eq!(
            p.process(&request("SET", &["k", "v", "EX", "10"])).status(),
            Status::InvalidArguments
        );
        assert_eq!(p.process(&request("DEL", &[])).status(), Status::InvalidArguments);
        assert_eq!(
            p.process(&request("HDEL", &["d"])).status(),
            Status::InvalidArguments
        );
    }

    #[test]
    fn integer_arguments_are_validated() {
        let p = processor();
        assert_eq!(
            p.process(&request("EXPIRE", &["k", "soon"])).status(),
            Status::InvalidArguments
        );
        assert_eq!(
            p.process(&request("LRANGE", &["l", "0", "end"])).status(),
            Status::InvalidArguments
        );
    }

    #[test]
    fn lset_error_texts_are_distinct() {
        let p = processor();
        let missing = p.process(&request("LSET", &["404", "0", "x"]));
        assert_eq!(
            missing,
            Response::Status {
                status: Status::Error,
                message: "no such key".to_string()
            }
        );

        p.process(&request("LPUSH", &["l", "a"]));
        let out_of_range = p.process(&request("LSET", &["l", "9", "x"]));
        assert_eq!(
            out_of_range,
            Response::Status {
                status: Status::Error,
                message: "index out of range".to_string()
            }
        );
    }

    #[test]
    fn variadic_commands() {
        let p = processor();
        p.process(&request("SET", &["a", "1"]));
        p.process(&request("SET", &["b", "2"]));
        assert_eq!(
            p.process(&request("DEL", &["a", "b", "404"])),
            Response::Int(2)
        );

        assert_eq!(
            p.process(&request("LPUSH", &["l", "a", "b", "c"])),
            Response::Int(3)
        );
        assert_eq!(
            p.process(&request("LRANGE", &["l", "0", "-1"])),
            Response::StrSlice(vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")])
        );
    }

    #[test]
    fn modifying_set_matches_the_wal_contract() {
        let p = processor();
        for cmd in [
            "SET", "SETEX", "DEL", "HSET", "HDEL", "LSET", "LPUSH", "LPOP", "EXPIRE", "PERSIST",
        ] {
            assert!(p.is_modifying(&request(cmd, &[])), "{cmd} must hit the WAL");
        }
        for cmd in ["GET", "KEYS", "HGET", "HKEYS", "HGETALL", "LLEN", "LRANGE", "LINDEX", "TTL"] {
            assert!(!p.is_modifying(&request(cmd, &[])), "{cmd} must not hit the WAL");
        }
    }

    #[test]
    fn normalize_ttl_subtracts_elapsed_time() {
        let p = processor();
        let mut r = request("SETEX", &["k", "100", "v"]);
        r.timestamp -= 40;
        p.normalize_ttl(&mut r).unwrap();
        let remaining = r.arg_int(1).unwrap();
        assert!((59..=60).contains(&remaining), "residual {remaining}");

        let mut r = request("EXPIRE", &["k", "10"]);
        r.timestamp -= 30;
        p.normalize_ttl(&mut r).unwrap();
        let remaining = r.arg_int(1).unwrap();
        assert!((-21..=-20).contains(&remaining), "residual {remaining}");

        // Non-TTL commands are untouched.
        let mut r = request("SET", &["k", "v"]);
        let args = r.args.clone();
        p.normalize_ttl(&mut r).unwrap();
        assert_eq!(r.args, args);
    }
}
