//! Lua scripts backing every compare-and-act operation.
//!
//! Each script is one atomic step on the server; the invariants they
//! protect (token-fenced release/extend, admission arithmetic on the
//! server clock) cannot be upheld with separate round trips.

/// Acquire a lease (`SET NX PX`).
///
/// KEYS\[1\] = lock key
/// ARGV\[1\] = fencing token
/// ARGV\[2\] = TTL in milliseconds
///
/// Returns 1 if acquired, 0 otherwise.
pub const LOCK_ACQUIRE: &str = r"
local ok = redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2])
if ok then
    return 1
end
return 0
";

/// Release a lease iff the stored token matches.
///
/// KEYS\[1\] = lock key
/// ARGV\[1\] = fencing token
///
/// Returns 1 if deleted, 0 if held by a different token, -1 if the key
/// is absent.
pub const LOCK_RELEASE: &str = r"
local owner = redis.call('GET', KEYS[1])
if owner == false then
    return -1
end
if owner ~= ARGV[1] then
    return 0
end
redis.call('DEL', KEYS[1])
return 1
";

/// Reset a lease's TTL iff the stored token matches.
///
/// KEYS\[1\] = lock key
/// ARGV\[1\] = fencing token
/// ARGV\[2\] = new TTL in milliseconds
///
/// Returns 1 if extended, 0 if held by a different token, -1 if the key
/// is absent.
pub const LOCK_EXTEND: &str = r"
local owner = redis.call('GET', KEYS[1])
if owner == false then
    return -1
end
if owner ~= ARGV[1] then
    return 0
end
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return 1
";

/// Fixed-window admission.
///
/// KEYS\[1\] = window counter key (caller embeds the window start)
/// ARGV\[1\] = limit
/// ARGV\[2\] = period in milliseconds
/// ARGV\[3\] = quantity
///
/// Returns `{allowed, remaining, retry_at_ms, reset_at_ms}` on the
/// server clock. The first increment arms the window TTL; admission is
/// `counter <= limit`, so denied requests advance the counter but never
/// the window.
pub const FIXED_WINDOW: &str = r"
local limit = tonumber(ARGV[1])
local period = tonumber(ARGV[2])
local n = tonumber(ARGV[3])
local count = redis.call('INCRBY', KEYS[1], n)
if count == n then
    redis.call('PEXPIRE', KEYS[1], period)
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    ttl = period
end
local time = redis.call('TIME')
local now = time[1] * 1000 + math.floor(time[2] / 1000)
local reset_at = now + ttl
local allowed = 0
local retry_at = reset_at
if count <= limit then
    allowed = 1
    retry_at = now
end
local remaining = limit - count
if remaining < 0 then
    remaining = 0
end
return {allowed, remaining, retry_at, reset_at}
";

/// GCRA admission against the stored theoretical arrival time.
///
/// KEYS\[1\] = TAT key
/// ARGV\[1\] = burst
/// ARGV\[2\] = limit
/// ARGV\[3\] = period in milliseconds
/// ARGV\[4\] = quantity
///
/// Returns `{allowed, remaining, retry_in_ms, reset_in_ms}`. Durations
/// are server-relative, so callers that sleep them are immune to clock
/// skew.
pub const GCRA: &str = r"
local burst = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local period = tonumber(ARGV[3])
local n = tonumber(ARGV[4])
local delta = period / limit
local time = redis.call('TIME')
local now = time[1] * 1000 + math.floor(time[2] / 1000)
local tat = tonumber(redis.call('GET', KEYS[1]))
if tat == nil or tat < now then
    tat = now
end
local allowance = burst * delta
local allowed = 0
local new_tat = tat
if tat - allowance <= now then
    allowed = 1
    new_tat = tat + n * delta
    redis.call('SET', KEYS[1], tostring(new_tat), 'PX', period)
end
local retry_in = new_tat - allowance - now
if retry_in < 0 then
    retry_in = 0
end
local remaining = math.floor((now + delta - (new_tat - allowance)) / delta)
if remaining < 0 then
    remaining = 0
end
local reset_in = new_tat - now
if reset_in < 0 then
    reset_in = 0
end
return {allowed, remaining, math.ceil(retry_in), math.ceil(reset_in)}
";

/// Token-bucket admission over a `{retry_at, count}` hash.
///
/// KEYS\[1\] = bucket key
/// ARGV\[1\] = limit
/// ARGV\[2\] = period in milliseconds
/// ARGV\[3\] = burst
/// ARGV\[4\] = now in milliseconds (caller-supplied, from the store clock)
/// ARGV\[5\] = quantity
///
/// Returns `{allowed, remaining, retry_in_ms, reset_in_ms}`. `remaining`
/// is the unspent burst capacity. Admission-equivalent to GCRA; the hash
/// keeps burst diagnostics inspectable.
pub const TOKEN_BUCKET: &str = r"
local limit = tonumber(ARGV[1])
local period = tonumber(ARGV[2])
local burst = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local n = tonumber(ARGV[5])
local delta = period / limit
local retry_at = tonumber(redis.call('HGET', KEYS[1], 'retry_at')) or 0
local count = tonumber(redis.call('HGET', KEYS[1], 'count')) or 0
local allowed = 0
if now >= retry_at then
    allowed = 1
    if retry_at < now then
        retry_at = now
    end
    retry_at = retry_at + n * delta
    count = 0
elseif count + n <= burst then
    allowed = 1
    count = count + n
    retry_at = retry_at + n * delta
end
if allowed == 1 then
    redis.call('HSET', KEYS[1], 'retry_at', tostring(retry_at), 'count', count)
    redis.call('PEXPIRE', KEYS[1], period)
end
local reset_in = retry_at - now
if reset_in < 0 then
    reset_in = 0
end
local remaining = burst - count
if remaining < 0 then
    remaining = 0
end
local retry_in = 0
if allowed == 0 then
    retry_in = reset_in
end
return {allowed, remaining, math.ceil(retry_in), math.ceil(reset_in)}
";
