/*
 *
 *  *
 *  *      Copyright (c) 2018-2025, SnackCloud All rights reserved.
 *  *
 *  *   Redistribution and use in source and binary forms, with or without
 *  *   modification, are permitted provided that the following conditions are met:
 *  *
 *  *   Redistributions of source code must retain the above copyright notice,
 *  *   this list of conditions and the following disclaimer.
 *  *   Redistributions in binary form must reproduce the above copyright
 *  *   notice, this list of conditions and the following disclaimer in the
 *  *   documentation and/or other materials provided with the distribution.
 *  *   Neither the name of the www.snackcloud.cn developer nor the names of its
 *  *   contributors may be used to endorse or promote products derived from
 *  *   this software without specific prior written permission.
 *  *   Author: SnackCloud
 *  *
 *
 */

use once_cell::sync::Lazy;
use redis::Script;

/// KEYS[1] lease key, ARGV[1] lock id, ARGV[2] storage time
pub static TRY_INSERT_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(r#"
        local key = KEYS[1]

        -- Somebody already created the row
        if redis.call('exists', key) == 1 then
            return 0
        end

        redis.call('hset', key,
            'lock_id', ARGV[1],
            'owner_id', '',
            'version', '0',
            'lock_count', '0',
            'expire_at', '0',
            'updated_at', ARGV[2])
        return 1
    "#)
});

/// KEYS[1] lease key, ARGV[1] expected version, ARGV[2..7] the new row
pub static CONDITIONAL_UPDATE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(r#"
        local key = KEYS[1]
        local expected = ARGV[1]

        -- Versions are compared as decimal strings, exactly as written
        local current = redis.call('hget', key, 'version')
        if not current or current ~= expected then
            return 0
        end

        redis.call('hset', key,
            'lock_id', ARGV[2],
            'owner_id', ARGV[3],
            'version', ARGV[4],
            'lock_count', ARGV[5],
            'expire_at', ARGV[6],
            'updated_at', ARGV[7])
        return 1
    "#)
});

/// KEYS[1] lease key, ARGV[1] expected version
pub static CONDITIONAL_DELETE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(r#"
        local key = KEYS[1]

        local current = redis.call('hget', key, 'version')
        if not current or current ~= ARGV[1] then
            return 0
        end

        return redis.call('del', key)
    "#)
});
