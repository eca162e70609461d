//! Lua scripts for the Redis backend.
//!
//! One script per multi-key primitive, so every operation the storage
//! contract calls atomic executes as a single server-side step. Job
//! state lives in a hash per job (scalar fields the scripts touch, plus
//! the message JSON and the payload envelope); partition membership
//! lives in ZSETs scored by position or visibility time.
//!
//! Scripts return a flat array whose first element is a tag; the Rust
//! side maps tags onto the queue error taxonomy.

use redis::Script;

/// Ready-sequence score: higher priority first, FIFO within a bucket.
/// `(9 - priority) * 1e12 + position` stays well inside f64 precision.
pub const ENQUEUE: &str = r#"
local now = tonumber(ARGV[8])
if ARGV[2] == "1" then
    local existing = redis.call("GET", KEYS[7])
    if existing then
        return {"dup", existing}
    end
end
if tonumber(ARGV[9]) > tonumber(ARGV[10]) then
    return {"payload_too_large", ARGV[10]}
end
local queue_backlog = redis.call("ZCARD", KEYS[2]) + redis.call("ZCARD", KEYS[3])
    + redis.call("ZCARD", KEYS[4])
local max_length = tonumber(ARGV[20])
if max_length >= 0 and queue_backlog >= max_length then
    return {"queue_full", ARGV[20]}
end
local backlog = tonumber(redis.call("GET", KEYS[12]) or "0")
if backlog >= tonumber(ARGV[14]) then
    return {"backlog_full", ARGV[14]}
end

local function window_sum(key, cur, span)
    local fields = redis.call("HGETALL", key)
    local sum = 0
    for i = 1, #fields, 2 do
        local idx = tonumber(fields[i])
        if idx <= cur - span then
            redis.call("HDEL", key, fields[i])
        else
            sum = sum + tonumber(fields[i + 1])
        end
    end
    return sum
end

local hour_used = window_sum(KEYS[8], tonumber(ARGV[17]), 60)
if hour_used >= tonumber(ARGV[11]) then
    return {"quota_hour", ARGV[11]}
end
local day_used = window_sum(KEYS[9], tonumber(ARGV[18]), 24)
if day_used >= tonumber(ARGV[12]) then
    return {"quota_day", ARGV[12]}
end
local storage = tonumber(redis.call("GET", KEYS[10]) or "0")
if storage + tonumber(ARGV[9]) > tonumber(ARGV[13]) then
    return {"storage", ARGV[13]}
end

local rps = tonumber(ARGV[15])
if rps > 0 then
    local burst = math.max(tonumber(ARGV[16]), 1)
    local tokens = tonumber(redis.call("HGET", KEYS[11], "tokens") or tostring(burst))
    local updated = tonumber(redis.call("HGET", KEYS[11], "updated_ms") or tostring(now))
    tokens = math.min(burst, tokens + (now - updated) * rps / 1000)
    if tokens < 1 then
        redis.call("HSET", KEYS[11], "tokens", tokens, "updated_ms", now)
        local wait = math.ceil((1 - tokens) * 1000 / rps)
        return {"throttled", tostring(wait)}
    end
    redis.call("HSET", KEYS[11], "tokens", tokens - 1, "updated_ms", now)
end

local seq = redis.call("HINCRBY", KEYS[5], "next_seq", 1)
redis.call("HINCRBY", KEYS[5], "enqueued_total", 1)
local visible = tonumber(ARGV[7])
local status = "ready"
local status_ts = now
if visible > now then
    redis.call("ZADD", KEYS[3], visible, ARGV[1])
    status = "pending"
    status_ts = visible
else
    local pos = redis.call("HINCRBY", KEYS[5], "pos_tail", 1)
    local score = (9 - tonumber(ARGV[6])) * 1e12 + pos
    redis.call("ZADD", KEYS[2], score, ARGV[1])
end
redis.call("HSET", KEYS[1],
    "message", ARGV[5],
    "payload", ARGV[4],
    "status", status,
    "status_ts", status_ts,
    "attempt_count", 0,
    "seq", seq,
    "priority", ARGV[6],
    "max_attempts", ARGV[21],
    "not_before_ms", ARGV[7],
    "queue", ARGV[22],
    "created_at_ms", now,
    "updated_at_ms", now,
    "lease_token", "",
    "cancel_requested", 0)
redis.call("ZADD", KEYS[14], seq, ARGV[1])
if ARGV[2] == "1" then
    redis.call("SET", KEYS[7], ARGV[1], "PX", tonumber(ARGV[3]))
end
redis.call("HINCRBY", KEYS[8], ARGV[17], 1)
redis.call("HINCRBY", KEYS[9], ARGV[18], 1)
redis.call("INCRBY", KEYS[10], tonumber(ARGV[9]))
redis.call("INCR", KEYS[12])
redis.call("SADD", KEYS[6], ARGV[22])
redis.call("SADD", KEYS[13], ARGV[19])
if ARGV[23] ~= "" then
    redis.call("SADD", KEYS[15], ARGV[1])
end
return {"ok", tostring(seq)}
"#;

/// Promotes due delayed jobs inline, then pops from the ready head under
/// the dequeue rate limit. Lease tokens are pre-generated by the caller
/// (ARGV[8..]) because scripts must stay deterministic.
pub const CLAIM: &str = r#"
local now = tonumber(ARGV[1])
if redis.call("HGET", KEYS[4], "paused") == "1" then
    return {"ok"}
end

local due = redis.call("ZRANGEBYSCORE", KEYS[2], "-inf", now, "LIMIT", 0, 128)
for _, id in ipairs(due) do
    redis.call("ZREM", KEYS[2], id)
    local jk = ARGV[7] .. id
    local status = redis.call("HGET", jk, "status")
    if status == "pending" or status == "retrying" then
        local pos
        if status == "retrying" and redis.call("HGET", KEYS[4], "retry_placement") == "head" then
            pos = redis.call("HINCRBY", KEYS[4], "pos_head", -1)
        else
            pos = redis.call("HINCRBY", KEYS[4], "pos_tail", 1)
        end
        local prio = tonumber(redis.call("HGET", jk, "priority") or "0")
        redis.call("ZADD", KEYS[1], (9 - prio) * 1e12 + pos, id)
        redis.call("HSET", jk, "status", "ready", "status_ts", now, "updated_at_ms", now)
    end
end

local rps = tonumber(ARGV[5])
local burst = math.max(tonumber(ARGV[6]), 1)
local tokens = 0
if rps > 0 then
    tokens = tonumber(redis.call("HGET", KEYS[5], "tokens") or tostring(burst))
    local updated = tonumber(redis.call("HGET", KEYS[5], "updated_ms") or tostring(now))
    tokens = math.min(burst, tokens + (now - updated) * rps / 1000)
end

local claimed = {}
local throttled = false
while #claimed < tonumber(ARGV[3]) do
    local head = redis.call("ZRANGE", KEYS[1], 0, 0)
    if #head == 0 then
        break
    end
    local id = head[1]
    local jk = ARGV[7] .. id
    if redis.call("HGET", jk, "status") ~= "ready" then
        redis.call("ZREM", KEYS[1], id)
    else
        if rps > 0 then
            if tokens < 1 then
                throttled = true
                break
            end
            tokens = tokens - 1
        end
        redis.call("ZREM", KEYS[1], id)
        local lease_until = now + tonumber(ARGV[2])
        local attempts = tonumber(redis.call("HGET", jk, "attempt_count") or "0")
        if attempts == 0 then
            redis.call("HSET", jk, "attempt_count", 1)
        end
        redis.call("HSET", jk,
            "status", "claimed",
            "status_ts", lease_until,
            "lease_token", ARGV[8 + #claimed],
            "last_worker", ARGV[4],
            "updated_at_ms", now,
            "cancel_requested", 0)
        redis.call("ZADD", KEYS[3], lease_until, id)
        claimed[#claimed + 1] = id
    end
end
if rps > 0 then
    redis.call("HSET", KEYS[5], "tokens", tokens, "updated_ms", now)
end

local out
if #claimed == 0 and throttled then
    out = {"throttled", tostring(math.ceil(1000 / rps))}
else
    out = {"ok"}
    for _, id in ipairs(claimed) do
        out[#out + 1] = id
    end
end
return out
"#;

pub const ACK: &str = r#"
local status = redis.call("HGET", KEYS[1], "status")
if not status then
    return {"not_found"}
end
if status == "cancelled" then
    return {"cancelled"}
end
if status == "succeeded" or status == "dead" then
    return {"terminal"}
end
if redis.call("HGET", KEYS[1], "lease_token") ~= ARGV[1] then
    return {"not_owner"}
end
if status == "claimed" and tonumber(redis.call("HGET", KEYS[1], "status_ts")) <= tonumber(ARGV[2]) then
    return {"expired"}
end

local size = redis.call("HSTRLEN", KEYS[1], "payload")
redis.call("ZREM", KEYS[2], ARGV[3])
redis.call("HINCRBY", KEYS[3], "succeeded_total", 1)
redis.call("DECRBY", KEYS[4], size)
redis.call("DECR", KEYS[5])
if ARGV[5] ~= "" then
    redis.call("SREM", KEYS[8], ARGV[3])
end
if redis.call("HGET", KEYS[3], "archive_completed") == "1" then
    redis.call("HSET", KEYS[1], "status", "succeeded", "status_ts", ARGV[2],
        "lease_token", "", "updated_at_ms", ARGV[2])
    redis.call("RPUSH", KEYS[9], ARGV[3])
    local cap = tonumber(redis.call("HGET", KEYS[3], "archive_limit") or "1000")
    while redis.call("LLEN", KEYS[9]) > cap do
        local old = redis.call("LPOP", KEYS[9])
        redis.call("DEL", ARGV[4] .. old, ARGV[4] .. old .. ":errors")
        redis.call("ZREM", KEYS[6], old)
    end
else
    redis.call("DEL", KEYS[1], KEYS[7])
    redis.call("ZREM", KEYS[6], ARGV[3])
end
return {"ok"}
"#;

pub const NACK: &str = r#"
local status = redis.call("HGET", KEYS[1], "status")
if not status then
    return {"not_found"}
end
if status == "cancelled" then
    return {"cancelled"}
end
if status == "succeeded" or status == "dead" then
    return {"terminal"}
end
if redis.call("HGET", KEYS[1], "lease_token") ~= ARGV[1] then
    return {"not_owner"}
end
if status == "claimed" and tonumber(redis.call("HGET", KEYS[1], "status_ts")) <= tonumber(ARGV[3]) then
    return {"expired"}
end

local attempts = tonumber(redis.call("HGET", KEYS[1], "attempt_count") or "0")
local entry = cjson.encode({
    attempt = attempts,
    at_ms = tonumber(ARGV[3]),
    worker_id = redis.call("HGET", KEYS[1], "last_worker"),
    kind = ARGV[7],
    message = ARGV[8],
})
redis.call("RPUSH", KEYS[7], entry)
redis.call("HSET", KEYS[1], "last_error", ARGV[8])
redis.call("ZREM", KEYS[2], ARGV[2])

local mode = ARGV[4]
local max_attempts = tonumber(redis.call("HGET", KEYS[1], "max_attempts") or "3")
if mode == "retry" and ARGV[6] == "1" and attempts >= max_attempts then
    mode = "dead"
end
if mode == "retry" then
    if ARGV[6] == "1" then
        redis.call("HINCRBY", KEYS[1], "attempt_count", 1)
    end
    redis.call("HSET", KEYS[1], "status", "retrying", "status_ts", ARGV[5],
        "lease_token", "", "updated_at_ms", ARGV[3])
    redis.call("ZADD", KEYS[3], tonumber(ARGV[5]), ARGV[2])
    return {"requeued"}
end
redis.call("HSET", KEYS[1], "status", "dead", "status_ts", ARGV[3],
    "lease_token", "", "updated_at_ms", ARGV[3],
    "fingerprint", ARGV[9], "died_at_ms", ARGV[3])
redis.call("RPUSH", KEYS[5], ARGV[2])
redis.call("DECR", KEYS[6])
if ARGV[10] ~= "" then
    redis.call("SREM", KEYS[8], ARGV[2])
end
return {"deadlettered"}
"#;

pub const EXTEND_LEASE: &str = r#"
local status = redis.call("HGET", KEYS[1], "status")
if not status then
    return {"not_found"}
end
if status == "cancelled" then
    return {"cancelled"}
end
if status ~= "claimed" then
    return {"terminal"}
end
if redis.call("HGET", KEYS[1], "lease_token") ~= ARGV[1] then
    return {"not_owner"}
end
local lease_until = tonumber(redis.call("HGET", KEYS[1], "status_ts"))
if lease_until <= tonumber(ARGV[3]) then
    return {"expired"}
end
if redis.call("HGET", KEYS[1], "cancel_requested") == "1" then
    redis.call("HSET", KEYS[1], "status", "cancelled", "status_ts", ARGV[3],
        "lease_token", "", "updated_at_ms", ARGV[3])
    redis.call("ZREM", KEYS[2], ARGV[2])
    redis.call("HINCRBY", KEYS[3], "cancelled_total", 1)
    redis.call("DECR", KEYS[4])
    if ARGV[5] ~= "" then
        redis.call("SREM", KEYS[5], ARGV[2])
    end
    return {"cancelled"}
end
local new_until = lease_until + tonumber(ARGV[4])
redis.call("HSET", KEYS[1], "status_ts", new_until, "updated_at_ms", ARGV[3])
redis.call("ZADD", KEYS[2], new_until, ARGV[2])
return {"ok", tostring(new_until)}
"#;

pub const RELEASE_LEASE: &str = r#"
local status = redis.call("HGET", KEYS[1], "status")
if not status then
    return {"not_found"}
end
if status ~= "claimed" then
    return {"terminal"}
end
if redis.call("HGET", KEYS[1], "lease_token") ~= ARGV[1] then
    return {"not_owner"}
end
redis.call("ZREM", KEYS[2], ARGV[2])
local pos = redis.call("HINCRBY", KEYS[4], "pos_head", -1)
local prio = tonumber(redis.call("HGET", KEYS[1], "priority") or "0")
redis.call("ZADD", KEYS[3], (9 - prio) * 1e12 + pos, ARGV[2])
redis.call("HSET", KEYS[1], "status", "ready", "status_ts", ARGV[3],
    "lease_token", "", "updated_at_ms", ARGV[3])
return {"ok"}
"#;

pub const CANCEL: &str = r#"
local status = redis.call("HGET", KEYS[1], "status")
if not status then
    return {"not_found"}
end
if status == "succeeded" or status == "dead" or status == "cancelled" then
    return {"not_cancellable"}
end
if status == "claimed" then
    redis.call("HSET", KEYS[1], "cancel_requested", 1, "updated_at_ms", ARGV[2])
    return {"requested"}
end
redis.call("ZREM", KEYS[2], ARGV[1])
redis.call("ZREM", KEYS[3], ARGV[1])
local size = redis.call("HSTRLEN", KEYS[1], "payload")
redis.call("HSET", KEYS[1], "status", "cancelled", "status_ts", ARGV[2],
    "lease_token", "", "updated_at_ms", ARGV[2])
redis.call("HINCRBY", KEYS[4], "cancelled_total", 1)
redis.call("DECR", KEYS[5])
redis.call("DECRBY", KEYS[6], size)
if ARGV[3] ~= "" then
    redis.call("SREM", KEYS[7], ARGV[1])
end
return {"cancelled"}
"#;

pub const RECLAIM_EXPIRED: &str = r#"
local now = tonumber(ARGV[1])
local expired = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", now, "LIMIT", 0, tonumber(ARGV[2]))
local reclaimed = {}
for _, id in ipairs(expired) do
    redis.call("ZREM", KEYS[1], id)
    local jk = ARGV[3] .. id
    local status = redis.call("HGET", jk, "status")
    if status == "claimed" then
        local attempts = tonumber(redis.call("HGET", jk, "attempt_count") or "0")
        local max_attempts = tonumber(redis.call("HGET", jk, "max_attempts") or "3")
        local entry = cjson.encode({
            attempt = attempts + 1,
            at_ms = now,
            worker_id = redis.call("HGET", jk, "last_worker"),
            kind = "retryable",
            message = "lease_expired",
        })
        redis.call("RPUSH", jk .. ":errors", entry)
        redis.call("HSET", jk, "last_error", "lease_expired")
        if attempts + 1 > max_attempts then
            redis.call("HSET", jk, "status", "dead", "status_ts", now,
                "lease_token", "", "updated_at_ms", now,
                "fingerprint", ARGV[4], "died_at_ms", now)
            redis.call("RPUSH", KEYS[3], id)
            redis.call("DECR", KEYS[4])
            reclaimed[#reclaimed + 1] = "dead:" .. id
        else
            redis.call("HINCRBY", jk, "attempt_count", 1)
            local pos
            if redis.call("HGET", KEYS[5], "retry_placement") == "head" then
                pos = redis.call("HINCRBY", KEYS[5], "pos_head", -1)
            else
                pos = redis.call("HINCRBY", KEYS[5], "pos_tail", 1)
            end
            local prio = tonumber(redis.call("HGET", jk, "priority") or "0")
            redis.call("ZADD", KEYS[2], (9 - prio) * 1e12 + pos, id)
            redis.call("HSET", jk, "status", "ready", "status_ts", now,
                "lease_token", "", "updated_at_ms", now)
            reclaimed[#reclaimed + 1] = "ready:" .. id
        end
    end
end
return reclaimed
"#;

pub const PROMOTE_DUE: &str = r#"
local now = tonumber(ARGV[1])
if redis.call("HGET", KEYS[3], "paused") == "1" then
    return {}
end
local due = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", now, "LIMIT", 0, tonumber(ARGV[2]))
local promoted = {}
for _, id in ipairs(due) do
    redis.call("ZREM", KEYS[1], id)
    local jk = ARGV[3] .. id
    local status = redis.call("HGET", jk, "status")
    if status == "pending" or status == "retrying" then
        local pos
        if status == "retrying" and redis.call("HGET", KEYS[3], "retry_placement") == "head" then
            pos = redis.call("HINCRBY", KEYS[3], "pos_head", -1)
        else
            pos = redis.call("HINCRBY", KEYS[3], "pos_tail", 1)
        end
        local prio = tonumber(redis.call("HGET", jk, "priority") or "0")
        redis.call("ZADD", KEYS[2], (9 - prio) * 1e12 + pos, id)
        redis.call("HSET", jk, "status", "ready", "status_ts", now, "updated_at_ms", now)
        promoted[#promoted + 1] = id
    end
end
return promoted
"#;

pub const RESCHEDULE: &str = r#"
local status = redis.call("HGET", KEYS[1], "status")
if not status then
    return {"not_found"}
end
if status ~= "pending" and status ~= "ready" then
    return {"not_reschedulable"}
end
redis.call("ZREM", KEYS[2], ARGV[1])
redis.call("ZREM", KEYS[3], ARGV[1])
local new_ms = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
redis.call("HSET", KEYS[1], "not_before_ms", new_ms, "updated_at_ms", now)
if new_ms > now then
    redis.call("ZADD", KEYS[3], new_ms, ARGV[1])
    redis.call("HSET", KEYS[1], "status", "pending", "status_ts", new_ms)
else
    local pos = redis.call("HINCRBY", KEYS[4], "pos_tail", 1)
    local prio = tonumber(redis.call("HGET", KEYS[1], "priority") or "0")
    redis.call("ZADD", KEYS[2], (9 - prio) * 1e12 + pos, ARGV[1])
    redis.call("HSET", KEYS[1], "status", "ready", "status_ts", now)
end
return {"ok"}
"#;

pub const DLQ_REQUEUE: &str = r#"
if redis.call("LREM", KEYS[1], 1, ARGV[1]) == 0 then
    return {"not_found"}
end
if ARGV[2] == "1" then
    redis.call("HSET", KEYS[2], "attempt_count", 0)
end
if ARGV[3] ~= "" then
    local old = redis.call("HSTRLEN", KEYS[2], "payload")
    redis.call("HSET", KEYS[2], "payload", ARGV[3])
    redis.call("INCRBY", KEYS[8], string.len(ARGV[3]) - old)
end
local seq = redis.call("HINCRBY", KEYS[4], "next_seq", 1)
local pos = redis.call("HINCRBY", KEYS[4], "pos_tail", 1)
local prio = tonumber(redis.call("HGET", KEYS[2], "priority") or "0")
redis.call("ZADD", KEYS[3], (9 - prio) * 1e12 + pos, ARGV[1])
redis.call("HSET", KEYS[2], "status", "ready", "status_ts", ARGV[5],
    "seq", seq, "queue", ARGV[4], "lease_token", "",
    "cancel_requested", 0, "updated_at_ms", ARGV[5])
redis.call("ZREM", KEYS[7], ARGV[1])
redis.call("ZADD", KEYS[6], seq, ARGV[1])
redis.call("INCR", KEYS[5])
return {"ok"}
"#;

pub const REMOVE_JOB: &str = r#"
local status = redis.call("HGET", KEYS[1], "status")
if not status then
    return 0
end
local size = redis.call("HSTRLEN", KEYS[1], "payload")
if status == "pending" or status == "ready" or status == "retrying" or status == "claimed" then
    redis.call("DECR", KEYS[9])
end
if status ~= "succeeded" and status ~= "cancelled" then
    redis.call("DECRBY", KEYS[8], size)
end
redis.call("ZREM", KEYS[2], ARGV[1])
redis.call("ZREM", KEYS[3], ARGV[1])
redis.call("ZREM", KEYS[4], ARGV[1])
redis.call("LREM", KEYS[5], 0, ARGV[1])
redis.call("ZREM", KEYS[6], ARGV[1])
redis.call("LREM", KEYS[10], 0, ARGV[1])
redis.call("DEL", KEYS[1], KEYS[7])
return 1
"#;

pub const REPLACE_PAYLOAD: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 0 then
    return {"not_found"}
end
local old = redis.call("HSTRLEN", KEYS[1], "payload")
redis.call("HSET", KEYS[1], "payload", ARGV[1], "updated_at_ms", ARGV[2])
redis.call("INCRBY", KEYS[2], string.len(ARGV[1]) - old)
return {"ok"}
"#;

/// Compiled scripts, hashed and cached by the redis client on first use.
pub struct RedisScripts {
    pub enqueue: Script,
    pub claim: Script,
    pub ack: Script,
    pub nack: Script,
    pub extend_lease: Script,
    pub release_lease: Script,
    pub cancel: Script,
    pub reclaim_expired: Script,
    pub promote_due: Script,
    pub reschedule: Script,
    pub dlq_requeue: Script,
    pub remove_job: Script,
    pub replace_payload: Script,
}

impl RedisScripts {
    pub fn new() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE),
            claim: Script::new(CLAIM),
            ack: Script::new(ACK),
            nack: Script::new(NACK),
            extend_lease: Script::new(EXTEND_LEASE),
            release_lease: Script::new(RELEASE_LEASE),
            cancel: Script::new(CANCEL),
            reclaim_expired: Script::new(RECLAIM_EXPIRED),
            promote_due: Script::new(PROMOTE_DUE),
            reschedule: Script::new(RESCHEDULE),
            dlq_requeue: Script::new(DLQ_REQUEUE),
            remove_job: Script::new(REMOVE_JOB),
            replace_payload: Script::new(REPLACE_PAYLOAD),
        }
    }
}

impl Default for RedisScripts {
    fn default() -> Self {
        Self::new()
    }
}
